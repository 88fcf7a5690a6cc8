//! Person localisation shared by the crowd and fall detectors

use crate::error::Result;
use crate::frame::Frame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Person bounding box in frame pixels, top-left origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersonBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl PersonBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
        }
    }

    pub fn centre(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Finds people in a frame.
///
/// Implementations are called concurrently from worker threads and must be `Send + Sync`.
/// An implementation that wraps a model which is not re-entrant has to serialise access
/// itself.
pub trait PersonLocator: Send + Sync {
    fn locate(&self, frame: &Frame) -> Result<Vec<PersonBox>>;
}

impl<L: PersonLocator + ?Sized> PersonLocator for Arc<L> {
    fn locate(&self, frame: &Frame) -> Result<Vec<PersonBox>> {
        (**self).locate(frame)
    }
}

/// Remembers the boxes of the last frame so the crowd and fall detectors share one
/// inference per dispatch.
///
/// The lock is held across the inner call, so concurrent callers for the same frame wait
/// for the first one and reuse its result.
pub struct CachingLocator<L> {
    inner: L,
    last: Mutex<Option<(u64, Arc<Vec<PersonBox>>)>>,
}

impl<L: PersonLocator> CachingLocator<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }
}

impl<L: PersonLocator> PersonLocator for CachingLocator<L> {
    fn locate(&self, frame: &Frame) -> Result<Vec<PersonBox>> {
        let mut last = self.last.lock();
        if let Some((seq, boxes)) = last.as_ref() {
            if *seq == frame.seq() {
                return Ok(boxes.as_ref().clone());
            }
        }

        let boxes = Arc::new(self.inner.locate(frame)?);
        *last = Some((frame.seq(), boxes.clone()));
        Ok(boxes.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLocator {
        calls: AtomicUsize,
    }

    impl PersonLocator for CountingLocator {
        fn locate(&self, _frame: &Frame) -> Result<Vec<PersonBox>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![PersonBox::new(0.0, 0.0, 10.0, 20.0, 0.9)])
        }
    }

    #[test]
    fn test_centre() {
        let b = PersonBox::new(10.0, 20.0, 30.0, 40.0, 0.8);
        assert_eq!(b.centre(), (25.0, 40.0));
    }

    #[test]
    fn test_caching_locator_runs_once_per_frame() {
        let locator = CachingLocator::new(CountingLocator {
            calls: AtomicUsize::new(0),
        });
        let first = Frame::new(1, RawFrame::solid(4, 4, [0, 0, 0]).unwrap());
        let second = Frame::new(2, RawFrame::solid(4, 4, [0, 0, 0]).unwrap());

        assert_eq!(locator.locate(&first).unwrap().len(), 1);
        assert_eq!(locator.locate(&first).unwrap().len(), 1);
        assert_eq!(locator.inner.calls.load(Ordering::SeqCst), 1);

        locator.locate(&second).unwrap();
        assert_eq!(locator.inner.calls.load(Ordering::SeqCst), 2);
    }
}
