//! Fire and smoke detection by flame-coloured pixel share

use super::{DetectionMetadata, Detector, DetectorId, Evaluation};
use crate::config::FireConfig;
use crate::error::Result;
use crate::frame::Frame;

/// Colour-band heuristic. Holds no model, so one instance serves every worker.
pub struct FireSmokeDetector {
    config: FireConfig,
}

impl FireSmokeDetector {
    pub fn new(config: FireConfig) -> Self {
        Self { config }
    }

    fn in_band(&self, [h, s, v]: [u8; 3]) -> bool {
        (self.config.hue_min..=self.config.hue_max).contains(&h)
            && s >= self.config.min_saturation
            && v >= self.config.min_value
    }
}

impl Default for FireSmokeDetector {
    fn default() -> Self {
        Self::new(FireConfig::default())
    }
}

impl Detector for FireSmokeDetector {
    fn id(&self) -> DetectorId {
        DetectorId::new(DetectorId::FIRE)
    }

    fn evaluate(&self, frame: &Frame) -> Result<Evaluation> {
        let total = frame.pixel_count();
        let matching = frame
            .pixels()
            .filter(|rgb| self.in_band(rgb_to_hsv(*rgb)))
            .count() as u64;

        let fraction = if total == 0 {
            0.0
        } else {
            matching as f32 / total as f32
        };

        Ok(Evaluation::triggered(fraction > self.config.min_pixel_fraction).with_metadata(
            DetectionMetadata::Fire {
                matching_pixels: matching,
                fraction,
            },
        ))
    }
}

/// RGB to HSV on the 8-bit OpenCV scale: hue 0..180, saturation and value 0..255
pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = v - min;

    let s = if v > 0.0 { delta * 255.0 / v } else { 0.0 };

    let mut h = if delta == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / delta
    } else if v == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }

    [
        (h / 2.0).round().min(180.0) as u8,
        s.round() as u8,
        v.round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;

    fn frame_with(width: u32, height: u32, fill: [u8; 3], patch: Option<([u8; 3], u32)>) -> Frame {
        let mut raw = RawFrame::solid(width, height, fill).unwrap();
        if let Some((colour, count)) = patch {
            for px in raw.pixels.chunks_exact_mut(3).take(count as usize) {
                px.copy_from_slice(&colour);
            }
        }
        Frame::new(1, raw)
    }

    #[test]
    fn test_hsv_conversion_matches_opencv_scale() {
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
        assert_eq!(rgb_to_hsv([255, 255, 255]), [0, 0, 255]);
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
        // amber flame colour
        assert_eq!(rgb_to_hsv([255, 210, 0]), [25, 255, 255]);
    }

    #[test]
    fn test_flame_coloured_frame_triggers() {
        let detector = FireSmokeDetector::default();
        let eval = detector.evaluate(&frame_with(64, 48, [255, 210, 0], None)).unwrap();
        assert!(eval.triggered);
        match eval.metadata {
            Some(DetectionMetadata::Fire {
                matching_pixels,
                fraction,
            }) => {
                assert_eq!(matching_pixels, 64 * 48);
                assert!((fraction - 1.0).abs() < f32::EPSILON);
            }
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_grey_and_blue_frames_stay_clear() {
        let detector = FireSmokeDetector::default();
        assert!(!detector.evaluate(&frame_with(32, 32, [90, 90, 90], None)).unwrap().triggered);
        assert!(!detector.evaluate(&frame_with(32, 32, [20, 40, 200], None)).unwrap().triggered);
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let config = FireConfig {
            min_pixel_fraction: 0.25,
            ..FireConfig::default()
        };
        let detector = FireSmokeDetector::new(config);

        // 100 pixels, exactly 25 flame pixels
        let at_threshold = frame_with(10, 10, [0, 0, 0], Some(([255, 210, 0], 25)));
        assert!(!detector.evaluate(&at_threshold).unwrap().triggered);

        let above = frame_with(10, 10, [0, 0, 0], Some(([255, 210, 0], 26)));
        assert!(detector.evaluate(&above).unwrap().triggered);
    }

    #[test]
    fn test_dark_pixels_outside_value_floor() {
        let detector = FireSmokeDetector::default();
        // right hue, too dark
        let eval = detector.evaluate(&frame_with(16, 16, [40, 33, 0], None)).unwrap();
        assert!(!eval.triggered);
    }
}
