//! Frame type and pixel helpers: grayscale conversion, dark detection, profile crops.

use image::{GrayImage, ImageFormat};
use std::io::Cursor;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRACTION: f32 = 0.95;
/// Pixel values below this are near-black.
const DARK_PIXEL_CUTOFF: u8 = 32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("crop region is empty")]
    EmptyCrop,
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// A captured 8-bit grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data, DARK_FRACTION);
        Ok(Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        })
    }

    /// Decode an encoded still image (PNG, JPEG, ...) into a grayscale frame.
    pub fn decode(bytes: &[u8], sequence: u32) -> Result<Self, FrameError> {
        let gray = image::load_from_memory(bytes)?.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(gray.into_raw(), width, height, sequence)
    }

    /// Encode the region given in normalized coordinates as PNG.
    ///
    /// The region is clamped to the frame; a region with no pixels left is an error.
    pub fn crop_png(&self, x: f32, y: f32, width: f32, height: f32) -> Result<Vec<u8>, FrameError> {
        let fw = self.width as f32;
        let fh = self.height as f32;
        let x0 = (x * fw).round().clamp(0.0, fw) as u32;
        let y0 = (y * fh).round().clamp(0.0, fh) as u32;
        let x1 = ((x + width) * fw).round().clamp(0.0, fw) as u32;
        let y1 = ((y + height) * fh).round().clamp(0.0, fh) as u32;
        if x1 <= x0 || y1 <= y0 {
            return Err(FrameError::EmptyCrop);
        }

        let image = GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width as usize) * (self.height as usize),
                actual: self.data.len(),
            },
        )?;
        let crop = image::imageops::crop_imm(&image, x0, y0, x1 - x0, y1 - y0).to_image();

        let mut png = Cursor::new(Vec::new());
        crop.write_to(&mut png, ImageFormat::Png)?;
        Ok(png.into_inner())
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of pixels are near-black (or the frame is empty).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < DARK_PIXEL_CUTOFF).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x12AB and 0xFF00, little-endian
        let y16 = vec![0xAB, 0x12, 0x00, 0xFF];
        assert_eq!(y16_to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0xFF]);
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[], DARK_FRACTION));
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRACTION));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRACTION));

        // 96% dark → dark; 94% dark → not dark
        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRACTION));

        let mut borderline = vec![10u8; 940];
        borderline.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRACTION));
    }

    #[test]
    fn test_new_flags_dark_frames() {
        let dark = Frame::new(vec![0u8; 16], 4, 4, 1).unwrap();
        assert!(dark.is_dark);
        let lit = Frame::new(vec![200u8; 16], 4, 4, 2).unwrap();
        assert!(!lit.is_dark);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = Frame::new(vec![0u8; 15], 4, 4, 0).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 16, actual: 15 }));
    }

    #[test]
    fn test_crop_png_dimensions() {
        let data: Vec<u8> = (0..100u32).map(|i| (i * 2) as u8).collect();
        let frame = Frame::new(data, 10, 10, 0).unwrap();

        let png = frame.crop_png(0.2, 0.3, 0.5, 0.4).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (5, 4));
        // Top-left of the crop is pixel (2, 3) of the frame.
        assert_eq!(decoded.get_pixel(0, 0).0[0], ((3 * 10 + 2) * 2) as u8);
    }

    #[test]
    fn test_crop_png_clamps_to_frame() {
        let frame = Frame::new(vec![100u8; 64], 8, 8, 0).unwrap();
        let png = frame.crop_png(0.75, 0.75, 0.5, 0.5).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (2, 2));
    }

    #[test]
    fn test_crop_png_empty_region() {
        let frame = Frame::new(vec![100u8; 64], 8, 8, 0).unwrap();
        assert!(matches!(frame.crop_png(1.0, 0.0, 0.2, 0.2), Err(FrameError::EmptyCrop)));
    }

    #[test]
    fn test_decode_png() {
        let image = GrayImage::from_pixel(6, 3, image::Luma([180u8]));
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png).unwrap();

        let frame = Frame::decode(png.get_ref(), 7).unwrap();
        assert_eq!((frame.width, frame.height, frame.sequence), (6, 3, 7));
        assert!(frame.data.iter().all(|&p| p == 180));
        assert!(!frame.is_dark);
    }
}
