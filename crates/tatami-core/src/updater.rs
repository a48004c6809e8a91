//! Serialized read-modify-write of member embeddings.
//!
//! Two kiosks confirming the same member at once would otherwise both read
//! the old embedding and one blend would be lost. Updates for one member id
//! run under that member's lock; different members never contend.

use crate::learning;
use crate::matcher::MatchError;
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{Descriptor, MemberId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("member not found: {0}")]
    MemberNotFound(MemberId),
    #[error("descriptor rejected: {0}")]
    Descriptor(#[from] MatchError),
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for UpdateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MemberNotFound(id) => UpdateError::MemberNotFound(id),
            other => UpdateError::Store(other),
        }
    }
}

/// What an update did to the stored embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The member had no embedding; the observation was stored as-is.
    Stored,
    /// The observation was blended into the existing embedding.
    Learned,
}

/// Per-key mutexes, created on demand and dropped once unused.
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<MemberId, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    fn acquire(&self, key: &MemberId) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    fn release(&self, key: &MemberId, lock: Arc<Mutex<()>>) {
        // One reference in the map plus ours: nobody else is waiting.
        self.locks.remove_if(key, |_, held| Arc::strong_count(held) == 2);
        drop(lock);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Applies the incremental update rule against an [`EmbeddingStore`].
pub struct EmbeddingUpdater<S> {
    store: S,
    locks: KeyedLocks,
}

impl<S: EmbeddingStore> EmbeddingUpdater<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fold `observed` into the member's stored embedding.
    ///
    /// Unknown members yield [`UpdateError::MemberNotFound`]; no member is created.
    pub fn update_embedding(
        &self,
        member_id: &MemberId,
        observed: &Descriptor,
    ) -> Result<UpdateOutcome, UpdateError> {
        let lock = self.locks.acquire(member_id);
        let result = {
            let _guard = lock.lock();
            self.apply(member_id, observed)
        };
        self.locks.release(member_id, lock);
        result
    }

    fn apply(&self, member_id: &MemberId, observed: &Descriptor) -> Result<UpdateOutcome, UpdateError> {
        let current = self.store.get(member_id)?;
        let outcome = if current.is_some() {
            UpdateOutcome::Learned
        } else {
            UpdateOutcome::Stored
        };

        let updated = learning::blend(current.as_ref(), observed)?;
        self.store.set(member_id, &updated)?;

        tracing::debug!(member = %member_id, ?outcome, "embedding updated");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::thread;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_first_update_stores_verbatim() {
        let updater = EmbeddingUpdater::new(MemoryStore::with_members(&[("m1", None)]));
        let observed = desc(&[0.4, 0.6]);
        let outcome = updater.update_embedding(&MemberId::from("m1"), &observed).unwrap();
        assert_eq!(outcome, UpdateOutcome::Stored);
        assert_eq!(updater.store().get(&MemberId::from("m1")).unwrap(), Some(observed));
    }

    #[test]
    fn test_second_update_blends() {
        let updater = EmbeddingUpdater::new(MemoryStore::with_members(&[("m1", Some(vec![1.0, 0.0]))]));
        let outcome = updater
            .update_embedding(&MemberId::from("m1"), &desc(&[0.0, 1.0]))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Learned);

        let stored = updater.store().get(&MemberId::from("m1")).unwrap().unwrap();
        assert!((stored.values()[0] - 0.7).abs() < 1e-6);
        assert!((stored.values()[1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_identical_update_leaves_embedding_unchanged() {
        let d = [0.3f32, -0.2, 0.9];
        let updater = EmbeddingUpdater::new(MemoryStore::with_members(&[("m1", Some(d.to_vec()))]));
        updater.update_embedding(&MemberId::from("m1"), &desc(&d)).unwrap();
        let stored = updater.store().get(&MemberId::from("m1")).unwrap().unwrap();
        for (a, b) in stored.values().iter().zip(d.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_unknown_member_not_created() {
        let updater = EmbeddingUpdater::new(MemoryStore::default());
        let err = updater
            .update_embedding(&MemberId::from("ghost"), &desc(&[0.1]))
            .unwrap_err();
        assert!(matches!(err, UpdateError::MemberNotFound(ref id) if id.as_str() == "ghost"));
        assert!(updater.store().get_all().unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_keeps_stored_value() {
        let updater = EmbeddingUpdater::new(MemoryStore::with_members(&[("m1", Some(vec![1.0, 0.0]))]));
        let err = updater
            .update_embedding(&MemberId::from("m1"), &desc(&[1.0]))
            .unwrap_err();
        assert!(matches!(err, UpdateError::Descriptor(MatchError::DimensionMismatch { .. })));
        assert_eq!(
            updater.store().get(&MemberId::from("m1")).unwrap(),
            Some(desc(&[1.0, 0.0]))
        );
    }

    #[test]
    fn test_concurrent_updates_not_lost() {
        const WRITERS: i32 = 8;
        let updater = Arc::new(EmbeddingUpdater::new(MemoryStore::with_members(&[
            ("m1", Some(vec![0.0])),
        ])));

        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let updater = Arc::clone(&updater);
                thread::spawn(move || {
                    updater
                        .update_embedding(&MemberId::from("m1"), &desc(&[1.0]))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every blend applied: the gap to 1.0 shrank by 0.7 per writer.
        let stored = updater.store().get(&MemberId::from("m1")).unwrap().unwrap();
        let expected = 1.0 - 0.7f32.powi(WRITERS);
        assert!((stored.values()[0] - expected).abs() < 1e-5, "got {}", stored.values()[0]);
        assert_eq!(updater.locks.len(), 0, "idle lock entries are dropped");
    }
}
