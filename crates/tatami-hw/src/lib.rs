//! tatami-hw — frame capture for the check-in kiosk.
//!
//! Provides V4L2 camera access, a still-image source for kiosks without a
//! camera (and for testing), and the grayscale frame helpers both share.

pub mod camera;
pub mod frame;
pub mod still;

use std::path::Path;
use thiserror::Error;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use still::StillSource;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),
    #[error("streaming not supported: {0}")]
    StreamingNotSupported(String),
    #[error("no images in {0}")]
    NoImages(String),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that yields grayscale frames on demand.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Open `path` as a [`StillSource`] if it is a directory, otherwise as a V4L2 device.
pub fn open_source(path: &str) -> Result<Box<dyn FrameSource + Send>, CameraError> {
    if Path::new(path).is_dir() {
        Ok(Box::new(StillSource::open(path)?))
    } else {
        Ok(Box::new(Camera::open(path)?))
    }
}
