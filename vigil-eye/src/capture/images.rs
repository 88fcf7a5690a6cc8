//! Replays a directory of still images as a video feed

use super::CaptureSource;
use crate::error::{Result, VisionError};
use crate::frame::RawFrame;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    looping: bool,
}

impl ImageSequenceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            cursor: 0,
            looping: false,
        }
    }

    /// Start over from the first image after the last one
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl CaptureSource for ImageSequenceSource {
    fn open(&mut self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(VisionError::Capture(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && Self::is_image(&path) {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(VisionError::Capture(format!(
                "No images found in {}",
                self.dir.display()
            )));
        }

        info!("Image sequence {} opened with {} frames", self.dir.display(), files.len());
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        if self.cursor >= self.files.len() {
            if !self.looping || self.files.is_empty() {
                return Ok(None);
            }
            self.cursor = 0;
        }

        let path = &self.files[self.cursor];
        self.cursor += 1;
        debug!("Decoding {}", path.display());

        let image = image::open(path)
            .map_err(|e| VisionError::Capture(format!("Failed to decode {}: {}", path.display(), e)))?
            .to_rgb8();
        RawFrame::from_rgb_image(image).map(Some)
    }

    fn close(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str, rgb: [u8; 3]) {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb(rgb));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_reads_images_in_name_order() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "b.png", [2, 0, 0]);
        write_png(dir.path(), "a.png", [1, 0, 0]);
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageSequenceSource::new(dir.path());
        source.open().unwrap();
        assert_eq!(source.len(), 2);

        assert_eq!(source.read().unwrap().unwrap().pixels[0], 1);
        assert_eq!(source.read().unwrap().unwrap().pixels[0], 2);
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn test_empty_directory_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let mut source = ImageSequenceSource::new(dir.path());
        assert!(matches!(source.open(), Err(VisionError::Capture(_))));
    }

    #[test]
    fn test_missing_directory_fails_to_open() {
        let mut source = ImageSequenceSource::new("/definitely/not/here");
        assert!(source.open().is_err());
    }

    #[test]
    fn test_corrupt_image_is_a_capture_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

        let mut source = ImageSequenceSource::new(dir.path());
        source.open().unwrap();
        assert!(matches!(source.read(), Err(VisionError::Capture(_))));
    }
}
