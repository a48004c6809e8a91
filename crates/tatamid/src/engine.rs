use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tatami_core::{DetectedFace, Detector, DetectorError};
use tatami_hw::{CameraError, Frame, FrameSource};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("detector not ready: {0}")]
    NotReady(String),
    #[error("camera is not open")]
    CameraClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Detector model state, published by the engine thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Loading,
    Ready { dimension: usize },
    Failed(String),
}

/// One polled frame and the faces found in it.
pub struct Capture {
    pub frame: Frame,
    pub faces: Vec<DetectedFace>,
}

pub type DetectorLoader =
    Box<dyn FnOnce() -> Result<Box<dyn Detector + Send>, DetectorError> + Send>;
pub type SourceOpener = Box<dyn Fn() -> Result<Box<dyn FrameSource + Send>, CameraError> + Send>;

/// Messages sent from the session and D-Bus handlers to the engine thread.
enum EngineRequest {
    OpenCamera {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    CloseCamera,
    Capture {
        reply: oneshot::Sender<Result<Capture, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    readiness: watch::Receiver<Readiness>,
    /// Whether callers want the camera held. Checked by the engine before every capture.
    camera_wanted: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready { .. })
    }

    /// Wait until the detector has loaded (or failed to) and return its descriptor length.
    pub async fn wait_ready(&self) -> Result<usize, EngineError> {
        let mut rx = self.readiness.clone();
        let state = rx
            .wait_for(|r| !matches!(r, Readiness::Loading))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match &*state {
            Readiness::Ready { dimension } => Ok(*dimension),
            Readiness::Failed(reason) => Err(EngineError::NotReady(reason.clone())),
            Readiness::Loading => Err(EngineError::NotReady("still loading".into())),
        }
    }

    /// Open the frame source and discard warm-up frames. A no-op if already open.
    pub async fn open_camera(&self) -> Result<(), EngineError> {
        self.camera_wanted.send_replace(true);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::OpenCamera { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Release the frame source. Never waits on the engine.
    ///
    /// Captures still queued are refused, so the camera is let go as soon as
    /// the engine finishes whatever it is doing now.
    pub fn close_camera(&self) -> Result<(), EngineError> {
        self.camera_wanted.send_replace(false);
        match self.tx.try_send(EngineRequest::CloseCamera) {
            // A full queue drains through the capture arm, which sees the flag.
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(EngineError::ChannelClosed),
        }
    }

    /// Grab one frame and detect faces in it. Dark frames yield no faces.
    pub async fn capture(&self) -> Result<Capture, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The detector loads on that thread; progress is visible through
/// [`EngineHandle::readiness`]. The frame source is only held between
/// `open_camera` and `close_camera`.
pub fn spawn_engine(
    load_detector: DetectorLoader,
    open_source: SourceOpener,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = watch::channel(Readiness::Loading);
    let (wanted_tx, wanted_rx) = watch::channel(false);

    std::thread::Builder::new()
        .name("tatami-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut detector = match load_detector() {
                Ok(detector) => {
                    let dimension = detector.dimension();
                    tracing::info!(dimension, "detector loaded");
                    let _ = ready_tx.send(Readiness::Ready { dimension });
                    Some(detector)
                }
                Err(e) => {
                    tracing::error!(error = %e, "detector failed to load");
                    let _ = ready_tx.send(Readiness::Failed(e.to_string()));
                    None
                }
            };
            let mut source: Option<Box<dyn FrameSource + Send>> = None;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::OpenCamera { reply } => {
                        let result = if source.is_some() {
                            Ok(())
                        } else {
                            run_open(&open_source, warmup_frames).map(|s| {
                                source = Some(s);
                            })
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::CloseCamera => release(&mut source),
                    EngineRequest::Capture { reply } => {
                        if !*wanted_rx.borrow() {
                            release(&mut source);
                        }
                        if reply.is_closed() {
                            tracing::trace!("capture abandoned by caller; skipped");
                            continue;
                        }
                        let result = match (source.as_mut(), detector.as_mut()) {
                            (None, _) => Err(EngineError::CameraClosed),
                            (_, None) => Err(EngineError::NotReady("detector failed to load".into())),
                            (Some(source), Some(detector)) => run_capture(source.as_mut(), detector.as_mut()),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        readiness: ready_rx,
        camera_wanted: Arc::new(wanted_tx),
    })
}

fn release(source: &mut Option<Box<dyn FrameSource + Send>>) {
    if let Some(s) = source.take() {
        tracing::info!(source = %s.describe(), "frame source closed");
    }
}

fn run_open(
    open_source: &SourceOpener,
    warmup_frames: usize,
) -> Result<Box<dyn FrameSource + Send>, EngineError> {
    let mut source = open_source()?;
    tracing::info!(source = %source.describe(), "frame source opened");

    // Webcams take a few frames to settle exposure after opening.
    if warmup_frames > 0 {
        tracing::debug!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = source.capture();
        }
    }
    Ok(source)
}

fn run_capture(
    source: &mut (dyn FrameSource + Send),
    detector: &mut (dyn Detector + Send),
) -> Result<Capture, EngineError> {
    let frame = source.capture()?;
    if frame.is_dark {
        tracing::trace!(seq = frame.sequence, "dark frame skipped");
        return Ok(Capture {
            frame,
            faces: Vec::new(),
        });
    }

    let faces = detector.detect(&frame.data, frame.width, frame.height)?;
    tracing::trace!(seq = frame.sequence, faces = faces.len(), "frame processed");
    Ok(Capture { frame, faces })
}
