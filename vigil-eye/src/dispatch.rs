//! Dispatch coordinator
//!
//! Fans one sampled frame out to every registered detector on the worker pool and joins
//! the answers into a single `DetectionResult` before the deadline. Every detector gets
//! exactly one outcome per dispatch, whatever happens to its job.

use crate::audit::AuditSink;
use crate::config::PipelineConfig;
use crate::detectors::{Detector, DetectorId};
use crate::error::{Result, VisionError};
use crate::frame::SharedFrame;
use crate::health::{DetectorHealth, HealthMonitor};
use crate::outcome::{DetectionResult, DetectorOutcome, OutcomeError};
use crate::pool::WorkerPool;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Registered {
    id: DetectorId,
    detector: Arc<dyn Detector>,
    /// Set while a job for this detector is queued or running
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the job finishes or is dropped unrun
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Dispatcher {
    detectors: Vec<Registered>,
    pool: WorkerPool,
    timeout: Duration,
    health: Arc<HealthMonitor>,
}

impl Dispatcher {
    pub fn new(
        detectors: Vec<Arc<dyn Detector>>,
        config: &PipelineConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        if detectors.is_empty() {
            return Err(VisionError::Config("No detectors registered".to_string()));
        }

        let mut seen = BTreeSet::new();
        let mut registered = Vec::with_capacity(detectors.len());
        for detector in detectors {
            let id = detector.id();
            if !seen.insert(id.clone()) {
                return Err(VisionError::Config(format!("Detector '{}' registered twice", id)));
            }
            registered.push(Registered {
                id,
                detector,
                in_flight: Arc::new(AtomicBool::new(false)),
            });
        }

        let pool = WorkerPool::new(config.effective_pool_size(registered.len()))?;
        let health = Arc::new(HealthMonitor::new(
            registered.iter().map(|r| r.id.clone()),
            config.degraded_after_timeouts,
            config.operator.clone(),
            audit,
        ));

        Ok(Self {
            detectors: registered,
            pool,
            timeout: config.dispatch_timeout(),
            health,
        })
    }

    pub fn detector_ids(&self) -> Vec<DetectorId> {
        self.detectors.iter().map(|r| r.id.clone()).collect()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn health_snapshot(&self) -> BTreeMap<DetectorId, DetectorHealth> {
        self.health.snapshot()
    }

    /// Evaluate `frame` on every detector. Returns within the dispatch timeout.
    pub fn dispatch(&self, frame: SharedFrame) -> DetectionResult {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let frame_seq = frame.seq();
        let timestamp = frame.captured_at();

        let (tx, rx) = bounded::<DetectorOutcome>(self.detectors.len());
        let mut outcomes = BTreeMap::new();
        let mut pending = BTreeSet::new();

        for registered in &self.detectors {
            if registered.in_flight.swap(true, Ordering::SeqCst) {
                warn!(detector = %registered.id, frame_seq, "Previous evaluation still running; skipped");
                outcomes.insert(
                    registered.id.clone(),
                    DetectorOutcome::degraded(registered.id.clone(), OutcomeError::Busy, Duration::ZERO),
                );
                continue;
            }

            let guard = InFlightGuard(registered.in_flight.clone());
            let detector = registered.detector.clone();
            let id = registered.id.clone();
            let frame = frame.clone();
            let tx = tx.clone();

            let job = move || {
                let job_started = Instant::now();
                let evaluated = panic::catch_unwind(AssertUnwindSafe(|| detector.evaluate(&frame)));
                let elapsed = job_started.elapsed();
                drop(frame);
                drop(guard);

                let outcome = match evaluated {
                    Ok(Ok(eval)) => DetectorOutcome::from_evaluation(id, eval, elapsed),
                    Ok(Err(e)) => {
                        warn!(detector = %id, frame_seq, "Detector failed: {}", e);
                        DetectorOutcome::degraded(
                            id,
                            OutcomeError::Failed { message: e.to_string() },
                            elapsed,
                        )
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!(detector = %id, frame_seq, "Detector panicked: {}", message);
                        DetectorOutcome::degraded(id, OutcomeError::Panicked { message }, elapsed)
                    }
                };
                // the dispatch may have given up on us already
                let _ = tx.send(outcome);
            };

            match self.pool.execute(job) {
                Ok(()) => {
                    pending.insert(registered.id.clone());
                }
                Err(e) => {
                    // only after shutdown; the dropped job released its in-flight guard
                    warn!(detector = %registered.id, frame_seq, "Job rejected: {}", e);
                    outcomes.insert(
                        registered.id.clone(),
                        DetectorOutcome::degraded(
                            registered.id.clone(),
                            OutcomeError::Rejected { message: e.to_string() },
                            Duration::ZERO,
                        ),
                    );
                }
            }
        }
        drop(tx);

        while !pending.is_empty() {
            match rx.recv_deadline(deadline) {
                Ok(outcome) => {
                    pending.remove(&outcome.detector_id);
                    outcomes.insert(outcome.detector_id.clone(), outcome);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let after_ms = self.timeout.as_millis() as u64;
        for id in pending {
            warn!(detector = %id, frame_seq, "Detector timed out after {}ms", after_ms);
            outcomes.insert(
                id.clone(),
                DetectorOutcome::degraded(id, OutcomeError::TimedOut { after_ms }, started.elapsed()),
            );
        }

        let result = DetectionResult {
            frame_seq,
            timestamp,
            outcomes,
        };
        debug!(
            frame_seq,
            elapsed_ms = started.elapsed().as_millis() as u64,
            triggered = result.outcomes.values().filter(|o| o.triggered).count(),
            degraded = result.degraded_count(),
            "Dispatch complete"
        );

        self.health.observe(&result);
        result
    }

    /// Stop the pool, waiting up to `grace` for running detectors. Returns how many
    /// evaluations were still running.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        self.pool.shutdown(grace)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::detectors::Evaluation;
    use crate::frame::{Frame, RawFrame};
    use std::thread;

    struct Fixed(&'static str, bool);

    impl Detector for Fixed {
        fn id(&self) -> DetectorId {
            DetectorId::from(self.0)
        }

        fn evaluate(&self, _frame: &crate::frame::Frame) -> Result<Evaluation> {
            Ok(Evaluation::triggered(self.1))
        }
    }

    struct Sleepy(Duration);

    impl Detector for Sleepy {
        fn id(&self) -> DetectorId {
            DetectorId::from("sleepy")
        }

        fn evaluate(&self, _frame: &crate::frame::Frame) -> Result<Evaluation> {
            thread::sleep(self.0);
            Ok(Evaluation::triggered(true))
        }
    }

    struct Panicky;

    impl Detector for Panicky {
        fn id(&self) -> DetectorId {
            DetectorId::from("panicky")
        }

        fn evaluate(&self, _frame: &crate::frame::Frame) -> Result<Evaluation> {
            panic!("lost the model")
        }
    }

    fn config(timeout_ms: u64) -> PipelineConfig {
        PipelineConfig {
            dispatch_timeout_ms: timeout_ms,
            ..PipelineConfig::default()
        }
    }

    fn frame(seq: u64) -> SharedFrame {
        Arc::new(Frame::new(seq, RawFrame::solid(4, 4, [0, 0, 0]).unwrap()))
    }

    #[test]
    fn test_rejects_empty_and_duplicate_registrations() {
        let sink = Arc::new(MemoryAuditSink::new());
        assert!(Dispatcher::new(vec![], &config(100), sink.clone()).is_err());

        let dup: Vec<Arc<dyn Detector>> = vec![Arc::new(Fixed("a", true)), Arc::new(Fixed("a", false))];
        assert!(matches!(
            Dispatcher::new(dup, &config(100), sink),
            Err(VisionError::Config(_))
        ));
    }

    #[test]
    fn test_collects_one_outcome_per_detector() {
        let detectors: Vec<Arc<dyn Detector>> =
            vec![Arc::new(Fixed("a", true)), Arc::new(Fixed("b", false))];
        let dispatcher =
            Dispatcher::new(detectors, &config(1000), Arc::new(MemoryAuditSink::new())).unwrap();
        assert_eq!(dispatcher.pool_size(), 2);

        let result = dispatcher.dispatch(frame(1));
        assert_eq!(result.frame_seq, 1);
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.triggered("a"));
        assert!(!result.triggered("b"));
        assert_eq!(result.degraded_count(), 0);
    }

    #[test]
    fn test_panicking_detector_is_contained() {
        let detectors: Vec<Arc<dyn Detector>> = vec![Arc::new(Panicky), Arc::new(Fixed("a", true))];
        let dispatcher =
            Dispatcher::new(detectors, &config(1000), Arc::new(MemoryAuditSink::new())).unwrap();

        let result = dispatcher.dispatch(frame(1));
        let outcome = result.outcome("panicky").unwrap();
        assert!(!outcome.triggered);
        assert!(matches!(outcome.error, Some(OutcomeError::Panicked { ref message }) if message == "lost the model"));
        assert!(result.triggered("a"));
    }

    #[test]
    fn test_slow_detector_times_out_then_reports_busy() {
        let detectors: Vec<Arc<dyn Detector>> = vec![
            Arc::new(Sleepy(Duration::from_millis(600))),
            Arc::new(Fixed("a", true)),
        ];
        let dispatcher =
            Dispatcher::new(detectors, &config(100), Arc::new(MemoryAuditSink::new())).unwrap();

        let started = Instant::now();
        let first = dispatcher.dispatch(frame(1));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(
            first.outcome("sleepy").unwrap().error,
            Some(OutcomeError::TimedOut { after_ms: 100 })
        ));
        assert!(first.triggered("a"));

        let second = dispatcher.dispatch(frame(2));
        assert_eq!(second.outcome("sleepy").unwrap().error, Some(OutcomeError::Busy));
        assert!(second.triggered("a"));
    }
}
