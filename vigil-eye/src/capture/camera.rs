//! USB webcam capture through OpenCV

use super::CaptureSource;
use crate::error::{Result, VisionError};
use crate::frame::RawFrame;
use opencv::{
    core::Mat,
    imgproc::{cvt_color, COLOR_BGR2RGB},
    prelude::*,
    videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH},
};
use tracing::{info, warn};

/// Consecutive empty reads tolerated before the device counts as gone
const MAX_EMPTY_READS: u32 = 10;

pub struct CameraSource {
    camera_id: u32,
    resolution: Option<(u32, u32)>,
    frame_rate: Option<u32>,
    capture: Option<VideoCapture>,
    empty_reads: u32,
}

impl CameraSource {
    pub fn new(camera_id: u32) -> Self {
        Self {
            camera_id,
            resolution: None,
            frame_rate: None,
            capture: None,
            empty_reads: 0,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = Some(fps);
        self
    }

    fn configure(&self, capture: &mut VideoCapture) -> Result<()> {
        if let Some((width, height)) = self.resolution {
            if width == 0 || height == 0 {
                return Err(VisionError::Capture("Invalid camera resolution".to_string()));
            }
            capture
                .set(CAP_PROP_FRAME_WIDTH, width as f64)
                .map_err(|e| VisionError::Capture(format!("Failed to set width: {}", e)))?;
            capture
                .set(CAP_PROP_FRAME_HEIGHT, height as f64)
                .map_err(|e| VisionError::Capture(format!("Failed to set height: {}", e)))?;
        }
        if let Some(fps) = self.frame_rate {
            capture
                .set(CAP_PROP_FPS, fps.max(1) as f64)
                .map_err(|e| VisionError::Capture(format!("Failed to set FPS: {}", e)))?;
        }
        Ok(())
    }
}

impl CaptureSource for CameraSource {
    fn open(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }

        let mut capture = VideoCapture::new(self.camera_id as i32, CAP_ANY).map_err(|e| {
            VisionError::Capture(format!("Failed to open camera {}: {}", self.camera_id, e))
        })?;

        if !capture.is_opened()? {
            return Err(VisionError::Capture(format!(
                "Camera {} failed to open",
                self.camera_id
            )));
        }

        self.configure(&mut capture)?;
        self.capture = Some(capture);
        self.empty_reads = 0;
        info!("Camera {} opened", self.camera_id);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| VisionError::Capture("Camera not initialized".to_string()))?;

        let mut bgr = Mat::default();
        loop {
            let grabbed = capture
                .read(&mut bgr)
                .map_err(|e| VisionError::Capture(format!("Failed to read frame: {}", e)))?;
            if grabbed && bgr.rows() > 0 && bgr.cols() > 0 {
                self.empty_reads = 0;
                break;
            }

            self.empty_reads += 1;
            warn!(
                "Camera {} returned an empty frame ({}/{})",
                self.camera_id, self.empty_reads, MAX_EMPTY_READS
            );
            if self.empty_reads >= MAX_EMPTY_READS {
                return Err(VisionError::Capture(format!(
                    "Camera {} stopped delivering frames",
                    self.camera_id
                )));
            }
        }

        let mut rgb = Mat::default();
        cvt_color(&bgr, &mut rgb, COLOR_BGR2RGB, 0)?;
        let pixels = rgb.data_bytes()?.to_vec();
        RawFrame::new(rgb.cols() as u32, rgb.rows() as u32, pixels).map(Some)
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("Failed to release camera {}: {}", self.camera_id, e);
            }
            info!("Camera {} closed", self.camera_id);
        }
    }

    fn describe(&self) -> String {
        format!("camera:{}", self.camera_id)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}
