//! Error types for vigil-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("ONNX Runtime error: {0}")]
    Ort(String),

    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

impl VisionError {
    /// Capture and IO failures end the pipeline. Anything else a source returns costs one
    /// frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VisionError::Capture(_) | VisionError::Io(_))
    }
}

#[cfg(feature = "camera")]
impl From<opencv::Error> for VisionError {
    fn from(err: opencv::Error) -> Self {
        VisionError::OpenCv(err.message)
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::Capture("camera 0 unplugged".to_string());
        assert!(err.to_string().contains("Capture error"));
        assert!(err.to_string().contains("camera 0 unplugged"));

        let err = VisionError::Pool("Pool is shut down".to_string());
        assert_eq!(err.to_string(), "Worker pool error: Pool is shut down");
    }

    #[test]
    fn test_vision_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let vision_err: VisionError = io_err.into();
        match vision_err {
            VisionError::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_only_capture_errors_are_fatal() {
        assert!(VisionError::Capture("gone".to_string()).is_fatal());
        assert!(!VisionError::Detector("boom".to_string()).is_fatal());
        assert!(!VisionError::OpenCv("bad conversion".to_string()).is_fatal());
        assert!(!VisionError::Pool("closed".to_string()).is_fatal());
        assert!(!VisionError::Config("bad".to_string()).is_fatal());
    }
}
