//! Pipeline driver
//!
//! One thread runs sample → dispatch → apply. Dispatch joins before the next frame is
//! sampled, so slow detectors make the sampler skip more frames instead of growing a
//! queue. Readers use the `PipelineHandle`, which never blocks the driver for longer
//! than a state copy.

use crate::alerts::{AlertAggregator, AlertState};
use crate::audit::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
use crate::capture::CaptureSource;
use crate::config::PipelineConfig;
use crate::detectors::{
    CachingLocator, CrowdDetector, Detector, DetectorId, FallDetector, FireSmokeDetector,
    PersonLocator,
};
use crate::dispatch::Dispatcher;
use crate::error::{Result, VisionError};
use crate::frame::{Frame, RawFrame, SharedFrame};
use crate::health::{DetectorHealth, HealthMonitor};
use crate::outcome::DetectionResult;
use crate::sampler::{FrameSampler, FrameTap};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Dispatches between throughput log lines
const THROUGHPUT_LOG_EVERY: u64 = 100;

/// Recoverable read errors in a row before the source is given up on
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// Why the driver loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExitReason {
    #[error("stopped")]
    Stopped,
    #[error("end of stream")]
    EndOfStream,
    #[error("capture failed: {message}")]
    CaptureFailed { message: String },
    #[error("driver crashed")]
    Crashed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_sampled: u64,
    pub dispatches: u64,
    pub capture_fps: f32,
    pub last_dispatch_ms: Option<u64>,
    pub mean_dispatch_ms: Option<f64>,
    pub running: bool,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Default)]
struct DispatchStats {
    dispatches: u64,
    total: Duration,
    last: Option<Duration>,
}

struct Shared {
    stop: AtomicBool,
    running: AtomicBool,
    dispatch: RwLock<DispatchStats>,
    exit: RwLock<Option<ExitReason>>,
}

pub struct Pipeline;

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            detectors: Vec::new(),
            audit: None,
        }
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    detectors: Vec<Arc<dyn Detector>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PipelineBuilder {
    /// Register a detector. Built-in ids switched off in the config are skipped.
    pub fn with_detector<D: Detector + 'static>(self, detector: D) -> Self {
        self.with_shared_detector(Arc::new(detector))
    }

    pub fn with_shared_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        let id = detector.id();
        if self.is_enabled(&id) {
            self.detectors.push(detector);
        } else {
            info!(detector = %id, "Detector disabled by configuration");
        }
        self
    }

    /// Fire, crowd and fall with the configured thresholds. Crowd and fall need a person
    /// locator and are left out without one.
    pub fn with_standard_detectors(mut self, locator: Option<Arc<dyn PersonLocator>>) -> Self {
        let fire = FireSmokeDetector::new(self.config.fire.clone());
        self = self.with_detector(fire);

        match locator {
            Some(locator) => {
                let shared: Arc<dyn PersonLocator> = Arc::new(CachingLocator::new(locator));
                let crowd = CrowdDetector::new(shared.clone(), self.config.crowd.clone());
                let fall = FallDetector::new(shared, self.config.fall.clone());
                self = self.with_detector(crowd).with_detector(fall);
            }
            None => {
                for id in [DetectorId::CROWD, DetectorId::FALL] {
                    if self.is_enabled(&DetectorId::from(id)) {
                        warn!(detector = id, "No person locator available; detector not registered");
                    }
                }
            }
        }
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn detector_ids(&self) -> Vec<DetectorId> {
        self.detectors.iter().map(|d| d.id()).collect()
    }

    fn is_enabled(&self, id: &DetectorId) -> bool {
        let toggles = &self.config.detectors;
        match id.as_str() {
            DetectorId::FIRE => toggles.fire,
            DetectorId::CROWD => toggles.crowd,
            DetectorId::FALL => toggles.fall,
            _ => true,
        }
    }

    fn audit_sink(&self) -> Arc<dyn AuditSink> {
        self.audit
            .clone()
            .unwrap_or_else(|| Arc::new(TracingAuditSink))
    }

    /// Run the registered detectors once on a single frame
    pub fn detect_once(self, raw: RawFrame) -> Result<DetectionResult> {
        self.config.validate().map_err(VisionError::Config)?;
        let audit = self.audit_sink();
        let mut dispatcher = Dispatcher::new(self.detectors, &self.config, audit)?;
        let result = dispatcher.dispatch(Arc::new(Frame::new(1, raw)));
        dispatcher.shutdown(self.config.shutdown_grace());
        Ok(result)
    }

    /// Open `source` and start the driver thread
    pub fn start<S: CaptureSource + 'static>(self, source: S) -> Result<PipelineHandle> {
        self.config.validate().map_err(VisionError::Config)?;
        let audit = self.audit_sink();
        let actor = self.config.operator.clone();

        let dispatcher = Dispatcher::new(self.detectors, &self.config, audit.clone())?;
        let detector_ids = dispatcher.detector_ids();
        let health = dispatcher.health();
        let aggregator = Arc::new(AlertAggregator::new(
            detector_ids.clone(),
            actor.clone(),
            audit.clone(),
        ));

        let mut sampler = FrameSampler::new(source, self.config.sample_every_n_frames);
        let description = sampler.describe();
        if let Err(e) = sampler.open() {
            error!("Failed to open {}: {}", description, e);
            audit.record(AuditEvent::new(
                actor,
                AuditAction::CaptureFailed {
                    message: e.to_string(),
                },
            ));
            return Err(e);
        }
        let tap = sampler.tap();

        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            dispatch: RwLock::new(DispatchStats::default()),
            exit: RwLock::new(None),
        });

        info!(
            source = %description,
            detectors = detector_ids.len(),
            pool = dispatcher.pool_size(),
            sample_every = self.config.sample_every_n_frames,
            timeout_ms = self.config.dispatch_timeout_ms,
            "Monitoring started"
        );
        audit.record(AuditEvent::new(
            actor.clone(),
            AuditAction::MonitoringStarted {
                source: description,
            },
        ));

        let driver = Driver {
            sampler,
            dispatcher,
            aggregator: aggregator.clone(),
            shared: shared.clone(),
            audit,
            actor,
            grace: self.config.shutdown_grace(),
        };
        let spawned = std::thread::Builder::new()
            .name("vigil-driver".to_string())
            .spawn(move || driver.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                return Err(VisionError::Pool(format!("Failed to spawn driver thread: {}", e)));
            }
        };

        Ok(PipelineHandle {
            shared,
            aggregator,
            health,
            tap,
            detector_ids,
            driver: Mutex::new(Some(handle)),
        })
    }
}

struct Driver<S> {
    sampler: FrameSampler<S>,
    dispatcher: Dispatcher,
    aggregator: Arc<AlertAggregator>,
    shared: Arc<Shared>,
    audit: Arc<dyn AuditSink>,
    actor: String,
    grace: Duration,
}

impl<S: CaptureSource> Driver<S> {
    fn run(mut self) -> ExitReason {
        let mut read_errors = 0u32;
        let exit = loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                break ExitReason::Stopped;
            }

            match self.sampler.next() {
                Ok(Some(frame)) => {
                    read_errors = 0;
                    self.process(frame);
                }
                Ok(None) => break ExitReason::EndOfStream,
                Err(e) if !e.is_fatal() && read_errors + 1 < MAX_CONSECUTIVE_READ_ERRORS => {
                    read_errors += 1;
                    warn!(consecutive = read_errors, "Skipping unreadable frame: {}", e);
                }
                Err(e) => {
                    error!("Capture failed: {}", e);
                    self.audit.record(AuditEvent::new(
                        self.actor.clone(),
                        AuditAction::CaptureFailed {
                            message: e.to_string(),
                        },
                    ));
                    break ExitReason::CaptureFailed {
                        message: e.to_string(),
                    };
                }
            }
        };

        self.sampler.close();
        let detached = self.dispatcher.shutdown(self.grace);
        if detached > 0 {
            warn!("{} detector job(s) still running at shutdown", detached);
        }

        *self.shared.exit.write() = Some(exit.clone());
        self.shared.running.store(false, Ordering::SeqCst);

        info!("Monitoring stopped: {}", exit);
        self.audit.record(AuditEvent::new(
            self.actor.clone(),
            AuditAction::MonitoringStopped {
                reason: exit.to_string(),
            },
        ));
        exit
    }

    fn process(&mut self, frame: SharedFrame) {
        let started = Instant::now();
        let result = self.dispatcher.dispatch(frame);
        self.aggregator.apply(&result);
        let elapsed = started.elapsed();

        let dispatches = {
            let mut stats = self.shared.dispatch.write();
            stats.dispatches += 1;
            stats.total += elapsed;
            stats.last = Some(elapsed);
            stats.dispatches
        };

        if dispatches % THROUGHPUT_LOG_EVERY == 0 {
            let capture = self.sampler.tap().stats();
            info!(
                dispatches,
                frames_captured = capture.frames_captured,
                capture_fps = capture.capture_fps,
                last_dispatch_ms = elapsed.as_millis() as u64,
                "Pipeline throughput"
            );
        }
    }
}

/// Read side and control of a running pipeline. Shareable across threads.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    aggregator: Arc<AlertAggregator>,
    health: Arc<HealthMonitor>,
    tap: FrameTap,
    detector_ids: Vec<DetectorId>,
    driver: Mutex<Option<JoinHandle<ExitReason>>>,
}

impl PipelineHandle {
    pub fn snapshot(&self) -> AlertState {
        self.aggregator.snapshot()
    }

    /// Most recently captured frame, sampled or not
    pub fn latest_frame(&self) -> Option<SharedFrame> {
        self.tap.latest_frame()
    }

    pub fn health(&self) -> BTreeMap<DetectorId, DetectorHealth> {
        self.health.snapshot()
    }

    pub fn detector_ids(&self) -> &[DetectorId] {
        &self.detector_ids
    }

    pub fn stats(&self) -> PipelineStats {
        let capture = self.tap.stats();
        let dispatch = self.shared.dispatch.read();
        let mean = (dispatch.dispatches > 0)
            .then(|| dispatch.total.as_secs_f64() * 1000.0 / dispatch.dispatches as f64);

        PipelineStats {
            frames_captured: capture.frames_captured,
            frames_sampled: capture.frames_sampled,
            dispatches: dispatch.dispatches,
            capture_fps: capture.capture_fps,
            last_dispatch_ms: dispatch.last.map(|d| d.as_millis() as u64),
            mean_dispatch_ms: mean,
            running: self.is_running(),
            exit_reason: self.shared.exit.read().clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Ask the driver to stop after the current dispatch. Does not block.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Block until the driver thread has exited. Concurrent callers all wait for the
    /// join and see the same exit reason.
    pub fn wait(&self) -> ExitReason {
        let mut driver = self.driver.lock();
        if let Some(handle) = driver.take() {
            // joined under the lock so later callers block until the exit is recorded
            return handle.join().unwrap_or_else(|_| {
                error!("Pipeline driver panicked");
                self.shared.running.store(false, Ordering::SeqCst);
                *self.shared.exit.write() = Some(ExitReason::Crashed);
                ExitReason::Crashed
            });
        }
        drop(driver);

        self.shared
            .exit
            .read()
            .clone()
            .unwrap_or(ExitReason::Stopped)
    }

    pub fn stop_and_wait(&self) -> ExitReason {
        self.stop();
        self.wait()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.driver.get_mut().is_some() {
            self.stop_and_wait();
        }
    }
}
