//! vigil-eye: real-time detection dispatch for vigil
//!
//! Samples frames from a live source, runs the fire, crowd and fall detectors against
//! each sampled frame on a bounded worker pool, and folds the outcomes into alert state
//! that the operator dashboard, the audit log and the assistant read without blocking
//! the pipeline.

pub mod alerts;
pub mod audit;
pub mod capture;
pub mod config;
pub mod detectors;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod health;
pub mod outcome;
pub mod pipeline;
pub mod pool;
pub mod sampler;

pub use alerts::{AlertAggregator, AlertState, DetectorAlert};
pub use audit::{AuditAction, AuditEvent, AuditSink};
pub use capture::CaptureSource;
pub use config::PipelineConfig;
pub use detectors::{Detector, DetectorId, Evaluation};
pub use dispatch::Dispatcher;
pub use error::{Result, VisionError};
pub use frame::{Frame, RawFrame, SharedFrame};
pub use outcome::{DetectionResult, DetectorOutcome, OutcomeError};
pub use pipeline::{ExitReason, Pipeline, PipelineHandle, PipelineStats};
