//! Scripted in-memory source for tests and demo feeds

use super::CaptureSource;
use crate::error::{Result, VisionError};
use crate::frame::RawFrame;
use std::time::{Duration, Instant};

pub struct SyntheticSource {
    frames: Vec<RawFrame>,
    cursor: usize,
    looping: bool,
    fail_after: Option<usize>,
    frame_interval: Option<Duration>,
    last_read: Option<Instant>,
    reads: usize,
    opened: bool,
}

impl SyntheticSource {
    /// Plays `frames` once, then ends the stream
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames,
            cursor: 0,
            looping: false,
            fail_after: None,
            frame_interval: None,
            last_read: None,
            reads: 0,
            opened: false,
        }
    }

    /// Replays `frames` until closed
    pub fn looping(frames: Vec<RawFrame>) -> Self {
        Self {
            looping: true,
            ..Self::new(frames)
        }
    }

    /// Fail every read after `reads` successful ones
    pub fn fail_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    /// Pace reads like a device with a native frame rate
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        let fps = fps.max(1);
        self.frame_interval = Some(Duration::from_secs_f64(1.0 / fps as f64));
        self
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_read) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }
}

impl CaptureSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        if self.frames.is_empty() && self.looping {
            return Err(VisionError::Capture(
                "Looping synthetic source needs at least one frame".to_string(),
            ));
        }
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        if !self.opened {
            return Err(VisionError::Capture("Synthetic source not opened".to_string()));
        }

        if let Some(limit) = self.fail_after {
            if self.reads >= limit {
                return Err(VisionError::Capture(format!(
                    "Synthetic source failed after {} reads",
                    limit
                )));
            }
        }

        if self.cursor >= self.frames.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }

        self.pace();
        let frame = self.frames[self.cursor].clone();
        self.cursor += 1;
        self.reads += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn describe(&self) -> String {
        format!("synthetic ({} frames)", self.frames.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<RawFrame> {
        (0..n)
            .map(|i| RawFrame::solid(2, 2, [i as u8, 0, 0]).unwrap())
            .collect()
    }

    #[test]
    fn test_read_requires_open() {
        let mut source = SyntheticSource::new(frames(1));
        assert!(source.read().is_err());
    }

    #[test]
    fn test_plays_once_then_ends() {
        let mut source = SyntheticSource::new(frames(2));
        source.open().unwrap();
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn test_looping_wraps_around() {
        let mut source = SyntheticSource::looping(frames(2));
        source.open().unwrap();
        let reds: Vec<u8> = (0..5)
            .map(|_| source.read().unwrap().unwrap().pixels[0])
            .collect();
        assert_eq!(reds, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_fail_after_injects_capture_error() {
        let mut source = SyntheticSource::looping(frames(1)).fail_after(2);
        source.open().unwrap();
        assert!(source.read().is_ok());
        assert!(source.read().is_ok());
        assert!(matches!(source.read(), Err(VisionError::Capture(_))));
    }
}
