//! Storage contracts consumed by the matcher and the check-in workflow.

use crate::types::{Descriptor, MemberCard, MemberEmbedding, MemberId, NewMember};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("member not found: {0}")]
    MemberNotFound(MemberId),
    #[error("corrupt record for member {member}: {reason}")]
    Corrupt { member: MemberId, reason: String },
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// How an attendance record was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInMethod {
    Manual,
    Facial,
    Qr,
}

impl CheckInMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInMethod::Manual => "manual",
            CheckInMethod::Facial => "facial",
            CheckInMethod::Qr => "qr",
        }
    }
}

/// A recorded attendance event, with what the kiosk needs to greet the member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub member: MemberCard,
    pub class_id: Option<String>,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckInOutcome {
    Recorded(CheckIn),
    AlreadyCheckedIn,
}

/// Per-member embedding persistence.
///
/// `get` distinguishes a missing member (`StoreError::MemberNotFound`)
/// from a member that has no embedding yet (`Ok(None)`).
pub trait EmbeddingStore: Send + Sync {
    fn get(&self, member_id: &MemberId) -> Result<Option<Descriptor>, StoreError>;

    /// Every member, enrolled or not, ordered by member id.
    fn get_all(&self) -> Result<Vec<MemberEmbedding>, StoreError>;

    /// Replace the member's embedding in full. Never creates a member.
    fn set(&self, member_id: &MemberId, embedding: &Descriptor) -> Result<(), StoreError>;

    /// Members a kiosk should match against. Defaults to every member.
    fn gallery(&self) -> Result<Vec<MemberEmbedding>, StoreError> {
        self.get_all()
    }
}

pub trait AttendanceRecorder: Send + Sync {
    fn record_check_in(
        &self,
        member_id: &MemberId,
        method: CheckInMethod,
    ) -> Result<CheckInOutcome, StoreError>;
}

pub trait MemberRegistry: Send + Sync {
    /// Create a member from already-validated details and record their first visit.
    fn enroll(&self, member: &NewMember) -> Result<MemberId, StoreError>;
}

impl<T: EmbeddingStore + ?Sized> EmbeddingStore for Arc<T> {
    fn get(&self, member_id: &MemberId) -> Result<Option<Descriptor>, StoreError> {
        (**self).get(member_id)
    }

    fn get_all(&self) -> Result<Vec<MemberEmbedding>, StoreError> {
        (**self).get_all()
    }

    fn set(&self, member_id: &MemberId, embedding: &Descriptor) -> Result<(), StoreError> {
        (**self).set(member_id, embedding)
    }

    fn gallery(&self) -> Result<Vec<MemberEmbedding>, StoreError> {
        (**self).gallery()
    }
}

impl<T: AttendanceRecorder + ?Sized> AttendanceRecorder for Arc<T> {
    fn record_check_in(
        &self,
        member_id: &MemberId,
        method: CheckInMethod,
    ) -> Result<CheckInOutcome, StoreError> {
        (**self).record_check_in(member_id, method)
    }
}

impl<T: MemberRegistry + ?Sized> MemberRegistry for Arc<T> {
    fn enroll(&self, member: &NewMember) -> Result<MemberId, StoreError> {
        (**self).enroll(member)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store used by the core tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct MemoryStore {
        pub members: Mutex<BTreeMap<MemberId, Option<Descriptor>>>,
        pub next_id: Mutex<u32>,
    }

    impl MemoryStore {
        pub fn with_members(members: &[(&str, Option<Vec<f32>>)]) -> Self {
            let store = Self::default();
            {
                let mut map = store.members.lock();
                for (id, values) in members {
                    let embedding = values.clone().map(|v| Descriptor::new(v).unwrap());
                    map.insert(MemberId::from(*id), embedding);
                }
            }
            store
        }
    }

    impl EmbeddingStore for MemoryStore {
        fn get(&self, member_id: &MemberId) -> Result<Option<Descriptor>, StoreError> {
            self.members
                .lock()
                .get(member_id)
                .cloned()
                .ok_or_else(|| StoreError::MemberNotFound(member_id.clone()))
        }

        fn get_all(&self) -> Result<Vec<MemberEmbedding>, StoreError> {
            Ok(self
                .members
                .lock()
                .iter()
                .map(|(id, embedding)| MemberEmbedding {
                    member_id: id.clone(),
                    embedding: embedding.clone(),
                })
                .collect())
        }

        fn set(&self, member_id: &MemberId, embedding: &Descriptor) -> Result<(), StoreError> {
            // Widen the read-modify-write window so unserialized updates would race.
            std::thread::yield_now();
            match self.members.lock().get_mut(member_id) {
                Some(slot) => {
                    *slot = Some(embedding.clone());
                    Ok(())
                }
                None => Err(StoreError::MemberNotFound(member_id.clone())),
            }
        }
    }

    impl MemberRegistry for MemoryStore {
        fn enroll(&self, member: &NewMember) -> Result<MemberId, StoreError> {
            let mut next = self.next_id.lock();
            *next += 1;
            let id = MemberId::new(format!("member-{}", *next));
            self.members
                .lock()
                .insert(id.clone(), member.descriptor.clone());
            Ok(id)
        }
    }
}
