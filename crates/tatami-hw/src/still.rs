//! Frame source that replays still images from a directory.

use crate::frame::Frame;
use crate::{CameraError, FrameSource};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "pgm", "bmp"];

/// Cycles through the image files of a directory in name order.
pub struct StillSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    sequence: u32,
}

impl StillSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CameraError> {
        let dir = dir.as_ref().to_path_buf();
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CameraError::NoImages(dir.display().to_string()));
        }
        tracing::info!(dir = %dir.display(), images = files.len(), "still-image source opened");

        Ok(Self {
            dir,
            files,
            next: 0,
            sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

impl FrameSource for StillSource {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();

        let bytes = fs::read(path)?;
        let frame = Frame::decode(&bytes, self.sequence)?;
        self.sequence = self.sequence.wrapping_add(1);
        tracing::trace!(file = %path.display(), seq = frame.sequence, "still frame");
        Ok(frame)
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_png(dir: &Path, name: &str, value: u8) {
        GrayImage::from_pixel(4, 2, Luma([value]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_cycles_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 200);
        write_png(dir.path(), "a.png", 100);
        fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();

        let mut source = StillSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let values: Vec<(u8, u32)> = (0..3)
            .map(|_| {
                let frame = source.capture().unwrap();
                (frame.data[0], frame.sequence)
            })
            .collect();
        assert_eq!(values, vec![(100, 0), (200, 1), (100, 2)]);
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StillSource::open(dir.path()),
            Err(CameraError::NoImages(_))
        ));
    }

    #[test]
    fn test_open_source_picks_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "only.png", 90);
        let mut source = crate::open_source(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(source.capture().unwrap().width, 4);
    }
}
