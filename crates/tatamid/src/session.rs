//! Kiosk capture session.
//!
//! One tokio task owns all session state and polls the engine on a fixed
//! interval. Callers talk to it through [`Session`] with request/reply
//! messages, so no session state is shared or locked.

use crate::engine::{Capture, EngineError, EngineHandle};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tatami_core::{
    enroll, match_gallery, AttendanceRecorder, CheckIn, CheckInMethod, CheckInOutcome, DetectedFace,
    Descriptor, EmbeddingStore, EmbeddingUpdater, EnrollError, EuclideanMatcher, FaceBox, FaceMatch,
    Gallery, MatchError, MatchedFace, MemberId, NewMember, StoreError, UpdateError,
};
use tatami_hw::{Frame, FrameError};
use tatami_store::{SqliteStore, FIRST_VISIT};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

pub type KioskUpdater = EmbeddingUpdater<Arc<SqliteStore>>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("gallery: {0}")]
    Gallery(#[from] MatchError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
    #[error("embedding update: {0}")]
    Update(#[from] UpdateError),
    #[error("profile image: {0}")]
    Frame(#[from] FrameError),
    #[error("no face at index {0} in the latest frame")]
    NoSuchFace(usize),
    #[error("face is already enrolled as member {0}")]
    FaceAlreadyKnown(MemberId),
    #[error("blocking task failed: {0}")]
    Join(String),
    #[error("session has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub detect_timeout: Duration,
    pub threshold: f32,
}

/// One face of the latest frame as shown on the kiosk.
#[derive(Debug, Clone, Serialize)]
pub struct KioskFace {
    pub index: usize,
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    pub outcome: FaceMatch,
    pub checked_in: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FacesSnapshot {
    /// Sequence number of the frame the faces came from.
    pub frame: Option<u32>,
    pub faces: Vec<KioskFace>,
}

enum Command {
    Faces {
        reply: oneshot::Sender<FacesSnapshot>,
    },
    CheckIn {
        member_id: MemberId,
        reply: oneshot::Sender<Result<CheckInOutcome, SessionError>>,
    },
    EnrollFace {
        index: usize,
        details: NewMember,
        reply: oneshot::Sender<Result<CheckIn, SessionError>>,
    },
    RefreshGallery {
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
}

enum Event {
    Stop,
    Command(Command),
    Tick,
}

/// Handle to a running session task.
pub struct Session {
    commands: mpsc::Sender<Command>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Session {
    /// Wait for the detector, load the gallery, open the camera and start polling.
    pub async fn start(
        engine: EngineHandle,
        store: Arc<SqliteStore>,
        updater: Arc<KioskUpdater>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let dimension = engine.wait_ready().await?;
        let matcher = EuclideanMatcher::new(config.threshold)?;

        let mut state = SessionState {
            engine,
            store,
            updater,
            matcher,
            dimension,
            gallery: Gallery::default(),
            checked_in: HashSet::new(),
            latest: None,
            matches: Vec::new(),
            detect_timeout: config.detect_timeout,
        };
        state.reload_gallery().await?;
        state.engine.open_camera().await?;

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(state, config.poll_interval, commands_rx, stop_rx));

        tracing::info!(
            dimension,
            poll_ms = config.poll_interval.as_millis() as u64,
            "kiosk session started"
        );
        Ok(Self {
            commands: commands_tx,
            stop: Some(stop_tx),
            task,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Faces in the most recent frame with their match outcome.
    pub async fn faces(&self) -> Result<FacesSnapshot, SessionError> {
        self.request(|reply| Command::Faces { reply }).await
    }

    pub async fn check_in(&self, member_id: MemberId) -> Result<CheckInOutcome, SessionError> {
        self.request(|reply| Command::CheckIn { member_id, reply }).await?
    }

    /// Enroll the unknown face at `index` of the latest frame. The enrollment is their first visit.
    pub async fn enroll_face(&self, index: usize, details: NewMember) -> Result<CheckIn, SessionError> {
        self.request(|reply| Command::EnrollFace {
            index,
            details,
            reply,
        })
        .await?
    }

    /// Re-read enrolled embeddings. Returns the gallery size.
    pub async fn refresh_gallery(&self) -> Result<usize, SessionError> {
        self.request(|reply| Command::RefreshGallery { reply }).await?
    }

    /// Stop polling. A capture in flight is abandoned and the camera is released.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "session task panicked");
        }
    }
}

struct SessionState {
    engine: EngineHandle,
    store: Arc<SqliteStore>,
    updater: Arc<KioskUpdater>,
    matcher: EuclideanMatcher,
    dimension: usize,
    gallery: Gallery,
    checked_in: HashSet<MemberId>,
    latest: Option<Frame>,
    matches: Vec<MatchedFace>,
    detect_timeout: Duration,
}

async fn run(
    mut state: SessionState,
    poll_interval: Duration,
    mut commands: mpsc::Receiver<Command>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = &mut stop => Event::Stop,
            Some(cmd) = commands.recv() => Event::Command(cmd),
            _ = ticker.tick() => Event::Tick,
        };

        match event {
            Event::Stop => break,
            Event::Command(cmd) => state.handle(cmd).await,
            Event::Tick => {
                let result = tokio::select! {
                    _ = &mut stop => break,
                    result = timeout(state.detect_timeout, state.engine.capture()) => result,
                };
                match result {
                    Ok(Ok(capture)) => state.apply_capture(capture),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "capture failed; treating as no faces");
                        state.clear();
                    }
                    Err(_) => {
                        tracing::warn!(
                            timeout_ms = state.detect_timeout.as_millis() as u64,
                            "detection timed out; skipping frame"
                        );
                        state.clear();
                    }
                }
            }
        }
    }

    if let Err(e) = state.engine.close_camera() {
        tracing::warn!(error = %e, "failed to release camera");
    }
    tracing::info!(checked_in = state.checked_in.len(), "kiosk session stopped");
}

/// Run a blocking store call off the async runtime.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, SessionError>
where
    T: Send + 'static,
    E: Into<SessionError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionError::Join(e.to_string()))?
        .map_err(Into::into)
}

impl SessionState {
    fn clear(&mut self) {
        self.latest = None;
        self.matches.clear();
    }

    fn apply_capture(&mut self, capture: Capture) {
        match match_gallery(&self.matcher, &capture.faces, &self.gallery) {
            Ok(matches) => {
                if !matches.is_empty() {
                    tracing::debug!(
                        seq = capture.frame.sequence,
                        faces = matches.len(),
                        known = matches.iter().filter(|m| !m.outcome.is_unknown()).count(),
                        "faces matched"
                    );
                }
                self.matches = matches;
                self.latest = Some(capture.frame);
            }
            Err(e) => {
                tracing::warn!(error = %e, "matching failed; treating as no faces");
                self.clear();
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Faces { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::CheckIn { member_id, reply } => {
                let _ = reply.send(self.check_in(member_id).await);
            }
            Command::EnrollFace {
                index,
                details,
                reply,
            } => {
                let _ = reply.send(self.enroll_face(index, details).await);
            }
            Command::RefreshGallery { reply } => {
                let _ = reply.send(self.reload_gallery().await);
            }
        }
    }

    fn snapshot(&self) -> FacesSnapshot {
        FacesSnapshot {
            frame: self.latest.as_ref().map(|f| f.sequence),
            faces: self
                .matches
                .iter()
                .enumerate()
                .map(|(index, m)| KioskFace {
                    index,
                    bbox: m.face.bbox,
                    outcome: m.outcome.clone(),
                    checked_in: m
                        .outcome
                        .member_id()
                        .is_some_and(|id| self.checked_in.contains(id)),
                })
                .collect(),
        }
    }

    async fn reload_gallery(&mut self) -> Result<usize, SessionError> {
        let store = Arc::clone(&self.store);
        let members = blocking(move || store.gallery()).await?;
        let gallery = Gallery::new(members)?;
        if let Some(stored) = gallery.dimension() {
            if stored != self.dimension {
                return Err(MatchError::DimensionMismatch {
                    expected: self.dimension,
                    actual: stored,
                }
                .into());
            }
        }
        tracing::debug!(members = gallery.len(), "gallery loaded");
        let len = gallery.len();
        self.gallery = gallery;
        Ok(len)
    }

    async fn check_in(&mut self, member_id: MemberId) -> Result<CheckInOutcome, SessionError> {
        if self.checked_in.contains(&member_id) {
            return Ok(CheckInOutcome::AlreadyCheckedIn);
        }

        let store = Arc::clone(&self.store);
        let id = member_id.clone();
        let mut outcome = blocking(move || store.record_check_in(&id, CheckInMethod::Facial)).await?;
        self.checked_in.insert(member_id.clone());

        // Only a new record confirms the face. Learn from it if it is still in view.
        if let CheckInOutcome::Recorded(check_in) = &mut outcome {
            if let Some(face) = self.face_of(&member_id) {
                self.learn(&member_id, face.descriptor).await;
                if !check_in.member.has_profile_image {
                    check_in.member.has_profile_image = self.fill_profile_image(&member_id, face.bbox).await;
                }
            }
        }

        Ok(outcome)
    }

    fn face_of(&self, member_id: &MemberId) -> Option<DetectedFace> {
        self.matches
            .iter()
            .find(|m| m.outcome.member_id() == Some(member_id))
            .map(|m| m.face.clone())
    }

    async fn learn(&mut self, member_id: &MemberId, observed: Descriptor) {
        let updater = Arc::clone(&self.updater);
        let id = member_id.clone();
        match blocking(move || updater.update_embedding(&id, &observed)).await {
            Ok(learned) => {
                tracing::debug!(member = %member_id, outcome = ?learned, "embedding refined");
                if let Err(e) = self.reload_gallery().await {
                    tracing::warn!(error = %e, "gallery reload failed");
                }
            }
            Err(e) => tracing::warn!(member = %member_id, error = %e, "embedding update failed"),
        }
    }

    /// Keep a crop of the confirmed face as the member's photo if they have none.
    /// Returns whether the member now has a photo.
    async fn fill_profile_image(&self, member_id: &MemberId, b: FaceBox) -> bool {
        let Some(frame) = self.latest.as_ref() else {
            return false;
        };
        let png = match frame.crop_png(b.x, b.y, b.width, b.height) {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!(member = %member_id, error = %e, "could not crop profile image");
                return false;
            }
        };
        let store = Arc::clone(&self.store);
        let id = member_id.clone();
        match blocking(move || store.set_profile_image_if_missing(&id, &png)).await {
            Ok(stored) => {
                if stored {
                    tracing::info!(member = %member_id, "profile image captured at check-in");
                }
                true
            }
            Err(e) => {
                tracing::warn!(member = %member_id, error = %e, "profile image update failed");
                false
            }
        }
    }

    async fn enroll_face(&mut self, index: usize, mut details: NewMember) -> Result<CheckIn, SessionError> {
        let face = self.matches.get(index).ok_or(SessionError::NoSuchFace(index))?;
        if let FaceMatch::Matched { member_id, .. } = &face.outcome {
            return Err(SessionError::FaceAlreadyKnown(member_id.clone()));
        }
        let frame = self.latest.as_ref().ok_or(SessionError::NoSuchFace(index))?;

        let b = face.face.bbox;
        details.profile_image = Some(frame.crop_png(b.x, b.y, b.width, b.height)?);
        details.descriptor = Some(face.face.descriptor.clone());

        let store = Arc::clone(&self.store);
        let member = blocking(move || -> Result<_, SessionError> {
            let id = enroll(&*store, details)?;
            Ok(store.member_card(&id)?)
        })
        .await?;
        self.checked_in.insert(member.id.clone());

        if let Err(e) = self.reload_gallery().await {
            tracing::warn!(error = %e, "gallery reload failed after enrollment");
        }
        Ok(CheckIn {
            member,
            class_id: None,
            class_name: FIRST_VISIT.to_string(),
        })
    }
}
