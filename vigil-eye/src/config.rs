//! Configuration for vigil-eye

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which detectors take part in dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorToggles {
    pub fire: bool,
    pub crowd: bool,
    pub fall: bool,
}

impl Default for DetectorToggles {
    fn default() -> Self {
        Self {
            fire: true,
            crowd: true,
            fall: true,
        }
    }
}

impl DetectorToggles {
    pub fn enabled_count(&self) -> usize {
        [self.fire, self.crowd, self.fall]
            .iter()
            .filter(|enabled| **enabled)
            .count()
    }

    /// Switch a detector off by its id. Returns false for unknown ids.
    pub fn disable(&mut self, id: &str) -> bool {
        match id {
            "fire" => self.fire = false,
            "crowd" => self.crowd = false,
            "fall" => self.fall = false,
            _ => return false,
        }
        true
    }
}

/// Flame colour band, OpenCV HSV scale (hue 0..180, saturation/value 0..255)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FireConfig {
    pub hue_min: u8,
    pub hue_max: u8,
    pub min_saturation: u8,
    pub min_value: u8,
    /// Share of frame pixels inside the band needed to trigger
    pub min_pixel_fraction: f32,
}

impl Default for FireConfig {
    fn default() -> Self {
        Self {
            hue_min: 22,
            hue_max: 35,
            min_saturation: 50,
            min_value: 50,
            // 2000 pixels of a 1000x600 frame
            min_pixel_fraction: 2000.0 / 600_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrowdConfig {
    /// People in a single grid cell that count as overcrowding
    pub threshold: u32,
    pub grid_rows: u32,
    pub grid_cols: u32,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            grid_rows: 1,
            grid_cols: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallConfig {
    pub min_confidence: f32,
    /// A person box wider than `aspect_ratio * height` is lying down
    pub aspect_ratio: f32,
    /// Frame size the ratio is measured at; boxes are rescaled to it first.
    /// Zero in either dimension measures in raw frame pixels.
    pub reference_width: u32,
    pub reference_height: u32,
}

impl Default for FallConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            aspect_ratio: 1.2,
            reference_width: 1020,
            reference_height: 600,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture device index (0, 1, 2, etc.)
    pub camera_id: u32,
    /// Forward every Nth captured frame to the detectors
    pub sample_every_n_frames: u32,
    /// Upper bound on one dispatch, slowest detector included
    pub dispatch_timeout_ms: u64,
    /// Worker threads; defaults to the number of registered detectors
    pub worker_pool_size: Option<usize>,
    /// Consecutive timeouts (or failures) before a detector is reported degraded
    pub degraded_after_timeouts: u32,
    /// How long teardown waits for busy workers before detaching them
    pub shutdown_grace_ms: u64,
    /// Actor recorded on lifecycle audit events
    pub operator: String,
    pub detectors: DetectorToggles,
    pub fire: FireConfig,
    pub crowd: CrowdConfig,
    pub fall: FallConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            sample_every_n_frames: 5,
            dispatch_timeout_ms: 3000,
            worker_pool_size: None,
            degraded_after_timeouts: 3,
            shutdown_grace_ms: 1000,
            operator: "system".to_string(),
            detectors: DetectorToggles::default(),
            fire: FireConfig::default(),
            crowd: CrowdConfig::default(),
            fall: FallConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate().map_err(VisionError::Config)?;
        Ok(config)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Pool size for a given number of registered detectors
    pub fn effective_pool_size(&self, detector_count: usize) -> usize {
        self.worker_pool_size.unwrap_or(detector_count).max(1)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.camera_id > 100 {
            return Err("Camera ID too large (max 100)".to_string());
        }

        if self.sample_every_n_frames == 0 || self.sample_every_n_frames > 1000 {
            return Err("sample_every_n_frames must be between 1 and 1000".to_string());
        }

        if self.dispatch_timeout_ms == 0 || self.dispatch_timeout_ms > 600_000 {
            return Err("dispatch_timeout_ms must be between 1 and 600000".to_string());
        }

        if let Some(size) = self.worker_pool_size {
            if size == 0 || size > 64 {
                return Err("worker_pool_size must be between 1 and 64".to_string());
            }
        }

        if self.degraded_after_timeouts == 0 {
            return Err("degraded_after_timeouts must be at least 1".to_string());
        }

        if self.detectors.enabled_count() == 0 {
            return Err("At least one detector must be enabled".to_string());
        }

        if self.fire.hue_min > self.fire.hue_max || self.fire.hue_max > 180 {
            return Err("Fire hue band must satisfy hue_min <= hue_max <= 180".to_string());
        }

        if !(0.0..=1.0).contains(&self.fire.min_pixel_fraction) {
            return Err("fire.min_pixel_fraction must be within 0.0..=1.0".to_string());
        }

        if self.crowd.threshold == 0 {
            return Err("crowd.threshold must be at least 1".to_string());
        }

        if self.crowd.grid_rows == 0
            || self.crowd.grid_cols == 0
            || self.crowd.grid_rows > 16
            || self.crowd.grid_cols > 16
        {
            return Err("Crowd grid must be between 1x1 and 16x16".to_string());
        }

        if !(0.0..=1.0).contains(&self.fall.min_confidence) {
            return Err("fall.min_confidence must be within 0.0..=1.0".to_string());
        }

        if !self.fall.aspect_ratio.is_finite() || self.fall.aspect_ratio <= 0.0 {
            return Err("fall.aspect_ratio must be a positive number".to_string());
        }

        Ok(())
    }
}
