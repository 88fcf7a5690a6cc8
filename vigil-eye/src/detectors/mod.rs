//! Detector capability contract and the built-in detectors
//!
//! A detector is a stateless predicate over one frame. It must not keep a reference to
//! the frame after `evaluate` returns and must be safe to call from any worker thread.
//! Every registered detector takes part in every dispatch.

pub mod crowd;
pub mod fall;
pub mod fire;
pub mod people;
#[cfg(feature = "yolo")]
pub mod yolo;

pub use crowd::{CrowdDetector, CrowdLevel, CrowdMetadata, Direction, DirectionStats};
pub use fall::FallDetector;
pub use fire::FireSmokeDetector;
pub use people::{CachingLocator, PersonBox, PersonLocator};
#[cfg(feature = "yolo")]
pub use yolo::YoloPersonLocator;

use crate::error::Result;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable detector identity, used as the key of outcomes and alert state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorId(String);

impl DetectorId {
    pub const FIRE: &'static str = "fire";
    pub const CROWD: &'static str = "crowd";
    pub const FALL: &'static str = "fall";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DetectorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Detector-specific detail attached to an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionMetadata {
    Fire { matching_pixels: u64, fraction: f32 },
    Crowd(CrowdMetadata),
    Fall { boxes: Vec<PersonBox> },
}

/// What a detector concluded about one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub triggered: bool,
    pub confidence: Option<f32>,
    pub metadata: Option<DetectionMetadata>,
}

impl Evaluation {
    pub fn triggered(triggered: bool) -> Self {
        Self {
            triggered,
            ..Self::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_metadata(mut self, metadata: DetectionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub trait Detector: Send + Sync {
    fn id(&self) -> DetectorId;

    /// Evaluate one frame. Errors are contained by the dispatcher and recorded on the
    /// outcome; they never stop the pipeline.
    fn evaluate(&self, frame: &Frame) -> Result<Evaluation>;
}
