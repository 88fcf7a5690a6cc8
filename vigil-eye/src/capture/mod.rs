//! Capture sources
//!
//! A source is read by exactly one consumer, the frame sampler. `read` returning
//! `Ok(None)` is a clean end of stream; an `Err` is a capture failure and stops the
//! pipeline.

#[cfg(feature = "camera")]
pub mod camera;
pub mod images;
pub mod synthetic;

#[cfg(feature = "camera")]
pub use camera::CameraSource;
pub use images::ImageSequenceSource;
pub use synthetic::SyntheticSource;

use crate::error::Result;
use crate::frame::RawFrame;

pub trait CaptureSource: Send {
    /// Acquire the underlying device or file handle
    fn open(&mut self) -> Result<()>;

    /// Next frame in capture order
    fn read(&mut self) -> Result<Option<RawFrame>>;

    /// Release the handle. Safe to call more than once.
    fn close(&mut self);

    /// Human readable identity used in logs and audit events
    fn describe(&self) -> String;
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        (**self).read()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
