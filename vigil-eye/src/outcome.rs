//! Per-detector outcomes and the aggregated result of one dispatch

use crate::detectors::{DetectionMetadata, DetectorId, Evaluation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Why a detector produced no verdict. The outcome still exists, with `triggered = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeError {
    /// `evaluate` returned an error
    #[error("failed: {message}")]
    Failed { message: String },
    /// `evaluate` panicked
    #[error("panicked: {message}")]
    Panicked { message: String },
    /// No answer before the dispatch deadline
    #[error("timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },
    /// The previous evaluation of this detector is still running
    #[error("previous evaluation still running")]
    Busy,
    /// The worker pool refused the job
    #[error("rejected: {message}")]
    Rejected { message: String },
}

impl OutcomeError {
    /// Timeouts and skipped-because-busy both mean the detector is not keeping up
    pub fn is_timeout(&self) -> bool {
        matches!(self, OutcomeError::TimedOut { .. } | OutcomeError::Busy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorOutcome {
    pub detector_id: DetectorId,
    pub triggered: bool,
    pub confidence: Option<f32>,
    pub metadata: Option<DetectionMetadata>,
    pub error: Option<OutcomeError>,
    pub elapsed_ms: u64,
}

impl DetectorOutcome {
    pub fn from_evaluation(detector_id: DetectorId, eval: Evaluation, elapsed: Duration) -> Self {
        Self {
            detector_id,
            triggered: eval.triggered,
            confidence: eval.confidence,
            metadata: eval.metadata,
            error: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Fail-open outcome: an error never raises an alert
    pub fn degraded(detector_id: DetectorId, error: OutcomeError, elapsed: Duration) -> Self {
        Self {
            detector_id,
            triggered: false,
            confidence: None,
            metadata: None,
            error: Some(error),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// One outcome per registered detector, keyed by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_seq: u64,
    pub timestamp: DateTime<Utc>,
    pub outcomes: BTreeMap<DetectorId, DetectorOutcome>,
}

impl DetectionResult {
    pub fn outcome(&self, id: &str) -> Option<&DetectorOutcome> {
        self.outcomes.get(&DetectorId::from(id))
    }

    pub fn triggered(&self, id: &str) -> bool {
        self.outcome(id).map(|o| o.triggered).unwrap_or(false)
    }

    pub fn any_triggered(&self) -> bool {
        self.outcomes.values().any(|o| o.triggered)
    }

    pub fn degraded_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_degraded()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_outcome_is_not_triggered() {
        let outcome = DetectorOutcome::degraded(
            DetectorId::from("fall"),
            OutcomeError::TimedOut { after_ms: 3000 },
            Duration::from_millis(3001),
        );
        assert!(!outcome.triggered);
        assert!(outcome.is_degraded());
        assert_eq!(outcome.elapsed_ms, 3001);
    }

    #[test]
    fn test_timeout_classification() {
        assert!(OutcomeError::TimedOut { after_ms: 1 }.is_timeout());
        assert!(OutcomeError::Busy.is_timeout());
        assert!(!OutcomeError::Failed {
            message: "x".to_string()
        }
        .is_timeout());
    }

    #[test]
    fn test_outcome_error_serializes_with_kind() {
        let json = serde_json::to_value(OutcomeError::TimedOut { after_ms: 250 }).unwrap();
        assert_eq!(json["kind"], "timed_out");
        assert_eq!(json["after_ms"], 250);
    }

    #[test]
    fn test_outcome_error_messages() {
        assert_eq!(
            OutcomeError::TimedOut { after_ms: 250 }.to_string(),
            "timed out after 250ms"
        );
        assert_eq!(
            OutcomeError::Failed {
                message: "no model".to_string()
            }
            .to_string(),
            "failed: no model"
        );
        assert_eq!(OutcomeError::Busy.to_string(), "previous evaluation still running");
    }
}
