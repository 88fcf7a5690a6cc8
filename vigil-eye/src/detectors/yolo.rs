//! YOLOv8 person locator on ONNX Runtime

use super::people::{PersonBox, PersonLocator};
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use image::imageops::{self, FilterType};
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

/// Square model input edge
const INPUT_SIZE: u32 = 640;
/// YOLOv8 output: 4 box coordinates followed by 80 COCO class scores
const OUTPUT_ROWS: usize = 84;
const PERSON_CLASS: usize = 0;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const NMS_IOU: f32 = 0.45;

/// ONNX Runtime sessions need `&mut` to run, so inference goes through one mutex. The
/// crowd and fall detectors share an instance, usually behind a `CachingLocator`.
pub struct YoloPersonLocator {
    session: Mutex<Session>,
    confidence_threshold: f32,
}

impl YoloPersonLocator {
    pub fn new(model_path: &Path) -> Result<Self> {
        let builder = Session::builder()
            .map_err(|e| VisionError::Ort(format!("Failed to create session builder: {}", e)))?;
        let builder = builder
            .with_intra_threads(2)
            .map_err(|e| VisionError::Ort(format!("Failed to set intra threads: {}", e)))?;
        let session = builder
            .commit_from_file(model_path)
            .map_err(|e| VisionError::Ort(format!("Failed to load YOLO model: {}", e)))?;

        info!("YOLO model loaded from {:?}", model_path);

        Ok(Self {
            session: Mutex::new(session),
            confidence_threshold: DEFAULT_CONFIDENCE,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Resize to the model input and lay out as normalised NCHW
    fn preprocess(frame: &Frame) -> Result<Tensor<f32>> {
        let image = frame
            .to_rgb_image()
            .ok_or_else(|| VisionError::Detector("Frame buffer has wrong length".to_string()))?;
        let resized = imageops::resize(&image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut data = vec![0f32; 3 * plane];
        for (idx, pixel) in resized.pixels().enumerate() {
            data[idx] = pixel[0] as f32 / 255.0;
            data[plane + idx] = pixel[1] as f32 / 255.0;
            data[2 * plane + idx] = pixel[2] as f32 / 255.0;
        }

        let shape = [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
        Tensor::from_array((shape, data.into_boxed_slice()))
            .map_err(|e| VisionError::Ort(format!("Failed to create input tensor: {}", e)))
    }

    fn postprocess(&self, data: &[f32], frame: &Frame) -> Vec<PersonBox> {
        let proposals = data.len() / OUTPUT_ROWS;
        let scale_x = frame.width() as f32 / INPUT_SIZE as f32;
        let scale_y = frame.height() as f32 / INPUT_SIZE as f32;
        let (frame_w, frame_h) = (frame.width() as f32, frame.height() as f32);

        let candidates = (0..proposals)
            .filter_map(|i| {
                let score = data[(4 + PERSON_CLASS) * proposals + i];
                if !score.is_finite() || score < self.confidence_threshold {
                    return None;
                }

                let best_other = (4..OUTPUT_ROWS)
                    .map(|row| data[row * proposals + i])
                    .fold(0f32, f32::max);
                if score < best_other {
                    return None;
                }

                let cx = data[i];
                let cy = data[proposals + i];
                let w = data[2 * proposals + i];
                let h = data[3 * proposals + i];

                let x1 = ((cx - w / 2.0) * scale_x).max(0.0);
                let y1 = ((cy - h / 2.0) * scale_y).max(0.0);
                let x2 = ((cx + w / 2.0) * scale_x).min(frame_w);
                let y2 = ((cy + h / 2.0) * scale_y).min(frame_h);
                if x2 <= x1 || y2 <= y1 {
                    return None;
                }

                Some(PersonBox::new(x1, y1, x2 - x1, y2 - y1, score))
            })
            .collect();

        apply_nms(candidates, NMS_IOU)
    }
}

impl PersonLocator for YoloPersonLocator {
    fn locate(&self, frame: &Frame) -> Result<Vec<PersonBox>> {
        let input = Self::preprocess(frame)?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| VisionError::Ort(format!("YOLO inference failed: {}", e)))?;
        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Ort(format!("Failed to extract output tensor: {}", e)))?;

        let people = self.postprocess(data, frame);
        debug!(frame_seq = frame.seq(), people = people.len(), "YOLO located people");
        Ok(people)
    }
}

/// Greedy non-maximum suppression, highest confidence first
pub fn apply_nms(mut boxes: Vec<PersonBox>, iou_threshold: f32) -> Vec<PersonBox> {
    boxes.retain(|b| b.confidence.is_finite());
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<PersonBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes
pub fn iou(a: &PersonBox, b: &PersonBox) -> f32 {
    let ix = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let iy = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    if ix <= 0.0 || iy <= 0.0 {
        return 0.0;
    }

    let inter = ix * iy;
    let union = a.width * a.height + b.width * b.height - inter;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = PersonBox::new(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = PersonBox::new(5.0, 0.0, 10.0, 10.0, 0.8);
        let c = PersonBox::new(20.0, 20.0, 5.0, 5.0, 0.8);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let boxes = vec![
            PersonBox::new(0.0, 0.0, 10.0, 10.0, 0.6),
            PersonBox::new(1.0, 1.0, 10.0, 10.0, 0.9),
            PersonBox::new(50.0, 50.0, 10.0, 10.0, 0.7),
        ];
        let kept = apply_nms(boxes, NMS_IOU);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }
}
