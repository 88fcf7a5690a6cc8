//! Frame sampler
//!
//! Drains the capture source at its native rate and forwards every Nth frame. Frames that
//! are not forwarded still become the latest frame for display.

use crate::capture::CaptureSource;
use crate::error::Result;
use crate::frame::{Frame, SharedFrame};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Window over which capture FPS is measured
const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_sampled: u64,
    pub capture_fps: f32,
}

/// Read side shared with the presentation layer
#[derive(Clone, Default)]
pub struct FrameTap {
    latest: Arc<RwLock<Option<SharedFrame>>>,
    stats: Arc<RwLock<CaptureStats>>,
}

impl FrameTap {
    pub fn latest_frame(&self) -> Option<SharedFrame> {
        self.latest.read().clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.read().clone()
    }
}

pub struct FrameSampler<S> {
    source: S,
    every_n: u64,
    pulled: u64,
    tap: FrameTap,
    window_start: Instant,
    window_frames: u64,
}

impl<S: CaptureSource> FrameSampler<S> {
    pub fn new(source: S, every_n: u32) -> Self {
        Self {
            source,
            every_n: every_n.max(1) as u64,
            pulled: 0,
            tap: FrameTap::default(),
            window_start: Instant::now(),
            window_frames: 0,
        }
    }

    pub fn tap(&self) -> FrameTap {
        self.tap.clone()
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub fn open(&mut self) -> Result<()> {
        self.window_start = Instant::now();
        self.source.open()
    }

    pub fn close(&mut self) {
        self.source.close();
    }

    /// Next sampled frame. `Ok(None)` at end of stream, `Err` when capture fails.
    ///
    /// Sequence numbers count every pulled frame from 1, so the sampled frames of
    /// `every_n = 5` carry 5, 10, 15 and so on.
    pub fn next(&mut self) -> Result<Option<SharedFrame>> {
        loop {
            let raw = match self.source.read()? {
                Some(raw) => raw,
                None => return Ok(None),
            };

            self.pulled += 1;
            let frame = Arc::new(Frame::new(self.pulled, raw));
            *self.tap.latest.write() = Some(frame.clone());

            let sampled = self.pulled % self.every_n == 0;
            self.record(sampled);

            if sampled {
                return Ok(Some(frame));
            }
        }
    }

    fn record(&mut self, sampled: bool) {
        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();

        let mut stats = self.tap.stats.write();
        stats.frames_captured = self.pulled;
        if sampled {
            stats.frames_sampled += 1;
        }
        if elapsed >= FPS_WINDOW {
            stats.capture_fps = self.window_frames as f32 / elapsed.as_secs_f32();
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
    }
}
