//! Face detector contract.
//!
//! The detection and descriptor models are external; the kiosk only needs
//! boxes and fixed-length descriptors back for each frame.

use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detection failed: {0}")]
    Failed(String),
    #[error("detector returned invalid output: {0}")]
    InvalidOutput(String),
    #[error("detector i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces zero or more faces per grayscale frame.
pub trait Detector {
    /// Detect faces in an 8-bit grayscale frame of `width * height` bytes.
    ///
    /// Boxes are normalized to the frame; descriptors have [`Self::dimension`] values.
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, DetectorError>;

    /// Length of every descriptor this detector produces.
    fn dimension(&self) -> usize;
}
