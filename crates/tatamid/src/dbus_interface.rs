use crate::engine::{EngineHandle, Readiness};
use crate::session::{KioskUpdater, Session, SessionConfig, SessionError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tatami_core::{
    enroll, match_faces, AttendanceRecorder, BeltRank, CheckInMethod, DetectedFace, Descriptor,
    EmbeddingStore, EnrollError, MemberId, NewMember, StoreError, UpdateError, UpdateOutcome,
};
use tatami_store::{
    ClassError, MemberStatus, NewClass, RankError, SqliteStore, DISPLAY_LEAD_MINUTES,
};
use tokio::sync::Mutex;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.tatami.Kiosk1";
pub const OBJECT_PATH: &str = "/org/tatami/Kiosk1";

/// Member details as sent by clients. The descriptor is optional.
#[derive(Deserialize)]
struct MemberDetails {
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    belt_rank: BeltRank,
    #[serde(default)]
    stripes: u8,
    #[serde(default)]
    descriptor: Option<Descriptor>,
}

impl From<MemberDetails> for NewMember {
    fn from(d: MemberDetails) -> Self {
        NewMember {
            first_name: d.first_name,
            last_name: d.last_name,
            email: d.email,
            phone: d.phone,
            belt_rank: d.belt_rank,
            stripes: d.stripes,
            profile_image: None,
            descriptor: d.descriptor,
        }
    }
}

fn parse<T: DeserializeOwned>(what: &str, json: &str) -> fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| fdo::Error::InvalidArgs(format!("{what}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn store_error(e: StoreError) -> fdo::Error {
    match e {
        StoreError::MemberNotFound(id) => fdo::Error::UnknownObject(format!("member not found: {id}")),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn enroll_error(e: EnrollError) -> fdo::Error {
    match e {
        EnrollError::Store(e) => store_error(e),
        other => fdo::Error::InvalidArgs(other.to_string()),
    }
}

fn session_error(e: SessionError) -> fdo::Error {
    match e {
        SessionError::Store(e) => store_error(e),
        SessionError::Enroll(e) => enroll_error(e),
        e @ (SessionError::NoSuchFace(_) | SessionError::FaceAlreadyKnown(_)) => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

/// Run a blocking store call off the async runtime.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> fdo::Result<T> + Send + 'static,
) -> fdo::Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("blocking task failed: {e}")))?
}

/// D-Bus interface for the Tatami kiosk daemon.
///
/// Bus name: org.tatami.Kiosk1
/// Object path: /org/tatami/Kiosk1
pub struct KioskService {
    store: Arc<SqliteStore>,
    updater: Arc<KioskUpdater>,
    engine: EngineHandle,
    session_config: SessionConfig,
    camera_device: String,
    session: Mutex<Option<Session>>,
}

impl KioskService {
    pub fn new(
        store: Arc<SqliteStore>,
        engine: EngineHandle,
        session_config: SessionConfig,
        camera_device: String,
    ) -> Self {
        let updater = Arc::new(KioskUpdater::new(Arc::clone(&store)));
        Self {
            store,
            updater,
            engine,
            session_config,
            camera_device,
            session: Mutex::new(None),
        }
    }

    /// Stop the running session, if any.
    pub async fn shutdown(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.stop().await;
        }
    }

    /// Let a running session see membership changes made over D-Bus.
    async fn refresh_session_gallery(&self) {
        if let Some(session) = self.session.lock().await.as_ref() {
            if let Err(e) = session.refresh_gallery().await {
                tracing::warn!(error = %e, "session gallery refresh failed");
            }
        }
    }
}

#[interface(name = "org.tatami.Kiosk1")]
impl KioskService {
    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let (detector, dimension) = match self.engine.readiness() {
            Readiness::Loading => ("loading".to_string(), None),
            Readiness::Ready { dimension } => ("ready".to_string(), Some(dimension)),
            Readiness::Failed(reason) => (format!("failed: {reason}"), None),
        };
        let session_active = self.session.lock().await.is_some();

        let store = Arc::clone(&self.store);
        let current_class = blocking(move || {
            store
                .current_class(chrono::Local::now().naive_local(), DISPLAY_LEAD_MINUTES)
                .map_err(store_error)
        })
        .await?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "ready": self.engine.is_ready(),
            "detector": detector,
            "dimension": dimension,
            "camera": self.camera_device,
            "threshold": self.session_config.threshold,
            "session_active": session_active,
            "current_class": current_class,
        })
        .to_string())
    }

    /// List all members.
    async fn members(&self) -> fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let members = blocking(move || store.list_members().map_err(store_error)).await?;
        to_json(&members)
    }

    /// Every member id with its stored embedding (null when not enrolled).
    async fn embeddings(&self) -> fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let all = blocking(move || store.get_all().map_err(store_error)).await?;
        to_json(&all)
    }

    /// Create a member from JSON details. Returns the new member id.
    async fn enroll(&self, details: &str) -> fdo::Result<String> {
        let details: MemberDetails = parse("member details", details)?;
        let store = Arc::clone(&self.store);
        let id = blocking(move || enroll(&*store, details.into()).map_err(enroll_error)).await?;
        self.refresh_session_gallery().await;
        Ok(id.to_string())
    }

    /// Fold an observed descriptor into a member's embedding.
    async fn update_embedding(&self, member_id: &str, descriptor: &str) -> fdo::Result<String> {
        let observed: Descriptor = parse("descriptor", descriptor)?;
        let member_id = MemberId::from(member_id);
        let updater = Arc::clone(&self.updater);
        let outcome = blocking(move || {
            updater
                .update_embedding(&member_id, &observed)
                .map_err(|e| match e {
                    UpdateError::MemberNotFound(id) => {
                        fdo::Error::UnknownObject(format!("member not found: {id}"))
                    }
                    UpdateError::Descriptor(e) => fdo::Error::InvalidArgs(e.to_string()),
                    UpdateError::Store(e) => store_error(e),
                })
        })
        .await?;
        self.refresh_session_gallery().await;
        Ok(match outcome {
            UpdateOutcome::Stored => "stored",
            UpdateOutcome::Learned => "learned",
        }
        .to_string())
    }

    /// Match a JSON list of detected faces against the kiosk gallery.
    async fn match_faces(&self, faces: &str) -> fdo::Result<String> {
        let faces: Vec<DetectedFace> = parse("faces", faces)?;
        let store = Arc::clone(&self.store);
        let gallery = blocking(move || store.gallery().map_err(store_error)).await?;
        let matches = match_faces(&faces, &gallery, self.session_config.threshold)
            .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        to_json(&matches)
    }

    /// Check a member in. Goes through the running session when there is one.
    async fn check_in(&self, member_id: &str) -> fdo::Result<String> {
        let member_id = MemberId::from(member_id);
        if let Some(session) = self.session.lock().await.as_ref() {
            let outcome = session.check_in(member_id).await.map_err(session_error)?;
            return to_json(&outcome);
        }

        let store = Arc::clone(&self.store);
        let outcome = blocking(move || {
            store
                .record_check_in(&member_id, CheckInMethod::Manual)
                .map_err(store_error)
        })
        .await?;
        to_json(&outcome)
    }

    /// Delete a member with their embedding and attendance.
    async fn remove_member(&self, member_id: &str) -> fdo::Result<bool> {
        let member_id = MemberId::from(member_id);
        let store = Arc::clone(&self.store);
        blocking(move || store.remove_member(&member_id).map_err(store_error)).await?;
        self.refresh_session_gallery().await;
        Ok(true)
    }

    /// PNG bytes of a member's profile photo; empty when none was captured.
    async fn profile_image(&self, member_id: &str) -> fdo::Result<Vec<u8>> {
        let member_id = MemberId::from(member_id);
        let store = Arc::clone(&self.store);
        let image = blocking(move || store.profile_image(&member_id).map_err(store_error)).await?;
        Ok(image.unwrap_or_default())
    }

    /// Set a member's belt (white, blue, purple, brown, black) and stripes.
    async fn set_rank(&self, member_id: &str, belt: &str, stripes: u8) -> fdo::Result<bool> {
        let belt: BeltRank = belt.parse().map_err(fdo::Error::InvalidArgs)?;
        let member_id = MemberId::from(member_id);
        let store = Arc::clone(&self.store);
        blocking(move || {
            store.set_rank(&member_id, belt, stripes).map_err(|e| match e {
                RankError::Store(e) => store_error(e),
                other => fdo::Error::InvalidArgs(other.to_string()),
            })
        })
        .await?;
        Ok(true)
    }

    /// Change a member's status (active, pending, overdue, inactive, trial, cancelled).
    async fn set_status(&self, member_id: &str, status: &str) -> fdo::Result<bool> {
        let status: MemberStatus = status.parse().map_err(fdo::Error::InvalidArgs)?;
        let member_id = MemberId::from(member_id);
        let store = Arc::clone(&self.store);
        blocking(move || store.set_status(&member_id, status).map_err(store_error)).await?;
        self.refresh_session_gallery().await;
        Ok(true)
    }

    /// A member's attendance history, newest first.
    async fn attendance(&self, member_id: &str) -> fdo::Result<String> {
        let member_id = MemberId::from(member_id);
        let store = Arc::clone(&self.store);
        let records = blocking(move || store.attendance(&member_id).map_err(store_error)).await?;
        to_json(&records)
    }

    /// Add a weekly class from JSON.
    async fn add_class(&self, class: &str) -> fdo::Result<String> {
        let class: NewClass = parse("class", class)?;
        let store = Arc::clone(&self.store);
        let added = blocking(move || {
            store.add_class(class).map_err(|e| match e {
                ClassError::Store(e) => store_error(e),
                other => fdo::Error::InvalidArgs(other.to_string()),
            })
        })
        .await?;
        to_json(&added)
    }

    /// The weekly timetable.
    async fn classes(&self) -> fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let classes = blocking(move || store.list_classes().map_err(store_error)).await?;
        to_json(&classes)
    }

    /// Start the kiosk capture session. Returns false if one is already running.
    async fn start_session(&self) -> fdo::Result<bool> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Ok(false);
        }
        let session = Session::start(
            self.engine.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.updater),
            self.session_config,
        )
        .await
        .map_err(session_error)?;
        *slot = Some(session);
        Ok(true)
    }

    /// Stop the kiosk capture session. Returns false if none was running.
    async fn stop_session(&self) -> fdo::Result<bool> {
        // Release the slot before waiting so other calls see the session as gone.
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                session.stop().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Faces in the latest frame with their match outcome.
    async fn faces(&self) -> fdo::Result<String> {
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| fdo::Error::Failed("no active session".into()))?;
        let snapshot = session.faces().await.map_err(session_error)?;
        to_json(&snapshot)
    }

    /// Enroll the unknown face at `index` of the latest frame as a new member.
    /// Returns the welcome card for their first visit.
    async fn enroll_face(&self, index: u32, details: &str) -> fdo::Result<String> {
        let details: MemberDetails = parse("member details", details)?;
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| fdo::Error::Failed("no active session".into()))?;
        let welcome = session
            .enroll_face(index as usize, details.into())
            .await
            .map_err(session_error)?;
        to_json(&welcome)
    }

    /// Re-read enrolled embeddings into the running session. Returns the gallery size.
    async fn refresh_gallery(&self) -> fdo::Result<u32> {
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| fdo::Error::Failed("no active session".into()))?;
        let len = session.refresh_gallery().await.map_err(session_error)?;
        Ok(len as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_details_defaults() {
        let details: MemberDetails = parse("details", r#"{"first_name":"Ana"}"#).unwrap();
        let member = NewMember::from(details);
        assert_eq!(member.first_name, "Ana");
        assert_eq!(member.last_name, "");
        assert_eq!((member.belt_rank, member.stripes), (BeltRank::White, 0));
        assert!(member.descriptor.is_none());
    }

    #[test]
    fn test_member_details_with_rank() {
        let details: MemberDetails =
            parse("details", r#"{"first_name":"Ana","belt_rank":"purple","stripes":3}"#).unwrap();
        let member = NewMember::from(details);
        assert_eq!((member.belt_rank, member.stripes), (BeltRank::Purple, 3));
        assert!(parse::<MemberDetails>("details", r#"{"first_name":"Ana","belt_rank":"red"}"#).is_err());
    }

    #[test]
    fn test_member_details_rejects_bad_descriptor() {
        let err = parse::<MemberDetails>("details", r#"{"first_name":"Ana","descriptor":[]}"#)
            .err()
            .unwrap();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            store_error(StoreError::MemberNotFound(MemberId::from("x"))),
            fdo::Error::UnknownObject(_)
        ));
        assert!(matches!(
            session_error(SessionError::NoSuchFace(3)),
            fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            session_error(SessionError::Enroll(EnrollError::MissingFirstName)),
            fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(session_error(SessionError::Stopped), fdo::Error::Failed(_)));
    }
}
