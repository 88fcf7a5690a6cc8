//! Fallen or unconscious person detection

use super::people::{PersonBox, PersonLocator};
use super::{DetectionMetadata, Detector, DetectorId, Evaluation};
use crate::config::FallConfig;
use crate::error::Result;
use crate::frame::Frame;
use std::sync::Arc;

/// A confident person box lying on its side is treated as a fall
pub struct FallDetector {
    locator: Arc<dyn PersonLocator>,
    config: FallConfig,
}

impl FallDetector {
    pub fn new(locator: Arc<dyn PersonLocator>, config: FallConfig) -> Self {
        Self { locator, config }
    }

    /// `frame_size` is the size of the frame the box was found in
    pub fn is_fallen(&self, person: &PersonBox, frame_size: (u32, u32)) -> bool {
        let (sx, sy) = self.reference_scale(frame_size);
        person.confidence > self.config.min_confidence
            && person.width * sx > person.height * sy * self.config.aspect_ratio
    }

    fn reference_scale(&self, (width, height): (u32, u32)) -> (f32, f32) {
        let (rw, rh) = (self.config.reference_width, self.config.reference_height);
        if rw == 0 || rh == 0 || width == 0 || height == 0 {
            return (1.0, 1.0);
        }
        (rw as f32 / width as f32, rh as f32 / height as f32)
    }
}

impl Detector for FallDetector {
    fn id(&self) -> DetectorId {
        DetectorId::new(DetectorId::FALL)
    }

    fn evaluate(&self, frame: &Frame) -> Result<Evaluation> {
        let size = (frame.width(), frame.height());
        let fallen: Vec<PersonBox> = self
            .locator
            .locate(frame)?
            .into_iter()
            .filter(|person| self.is_fallen(person, size))
            .collect();

        let mut eval = Evaluation::triggered(!fallen.is_empty());
        if let Some(best) = fallen.iter().map(|p| p.confidence).reduce(f32::max) {
            eval = eval.with_confidence(best);
        }
        Ok(eval.with_metadata(DetectionMetadata::Fall { boxes: fallen }))
    }
}
