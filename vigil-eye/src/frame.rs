//! Frames flowing through the pipeline

use crate::error::{Result, VisionError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Largest frame accepted from a source (8K)
const MAX_DIMENSION: u32 = 7680;

/// Pixels as handed over by a capture source, before sequencing
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// RGB8, row-major, `width * height * 3` bytes
    pub pixels: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(VisionError::Capture("Frame dimensions must be non-zero".to_string()));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(VisionError::Capture(format!(
                "Frame {}x{} exceeds {}px limit",
                width, height, MAX_DIMENSION
            )));
        }
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(VisionError::Capture(format!(
                "Frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// A frame filled with one colour
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take((width as usize) * (height as usize) * 3)
            .collect();
        Self::new(width, height, pixels)
    }

    pub fn from_rgb_image(image: image::RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }
}

/// Immutable sampled frame. Shared between detectors as `Arc<Frame>`.
#[derive(Debug)]
pub struct Frame {
    seq: u64,
    width: u32,
    height: u32,
    captured_at: DateTime<Utc>,
    pixels: Box<[u8]>,
}

pub type SharedFrame = Arc<Frame>;

impl Frame {
    pub fn new(seq: u64, raw: RawFrame) -> Self {
        Self {
            seq,
            width: raw.width,
            height: raw.height,
            captured_at: Utc::now(),
            pixels: raw.pixels.into_boxed_slice(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Raw RGB8 bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Iterate pixels as `[r, g, b]`
    pub fn pixels(&self) -> impl Iterator<Item = [u8; 3]> + '_ {
        self.pixels.chunks_exact(3).map(|p| [p[0], p[1], p[2]])
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + (x as usize)) * 3;
        self.pixels
            .get(offset..offset + 3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Copy into an `image` buffer, e.g. for PNG encoding
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.pixels.to_vec())
    }
}
