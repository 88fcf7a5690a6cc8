//! Alert state aggregation
//!
//! `apply` is the only writer. It takes the write lock once per result, so a concurrent
//! `snapshot` sees the state either entirely before or entirely after a result.

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::detectors::{DetectionMetadata, DetectorId};
use crate::outcome::DetectionResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorAlert {
    /// Mirrors `triggered` of the most recently applied outcome
    pub active: bool,
    /// Number of inactive to active edges
    pub total_count: u64,
    pub last_transition: Option<DateTime<Utc>>,
    /// Detail from the most recent outcome, e.g. crowd directions
    pub metadata: Option<DetectionMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub detectors: BTreeMap<DetectorId, DetectorAlert>,
    pub last_transition: Option<DateTime<Utc>>,
    pub last_frame_seq: Option<u64>,
    pub results_applied: u64,
}

impl AlertState {
    pub fn get(&self, id: &str) -> Option<&DetectorAlert> {
        self.detectors.get(&DetectorId::from(id))
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.get(id).map(|a| a.active).unwrap_or(false)
    }

    pub fn total_count(&self, id: &str) -> u64 {
        self.get(id).map(|a| a.total_count).unwrap_or(0)
    }

    pub fn active_alerts(&self) -> Vec<DetectorId> {
        self.detectors
            .iter()
            .filter(|(_, a)| a.active)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// One edge of one detector's alert flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertTransition {
    pub detector: DetectorId,
    pub active: bool,
    pub frame_seq: u64,
    pub total_count: u64,
    pub at: DateTime<Utc>,
}

pub struct AlertAggregator {
    state: RwLock<AlertState>,
    actor: String,
    audit: Arc<dyn AuditSink>,
}

impl AlertAggregator {
    pub fn new(
        detectors: impl IntoIterator<Item = DetectorId>,
        actor: impl Into<String>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let state = AlertState {
            detectors: detectors
                .into_iter()
                .map(|id| (id, DetectorAlert::default()))
                .collect(),
            ..AlertState::default()
        };
        Self {
            state: RwLock::new(state),
            actor: actor.into(),
            audit,
        }
    }

    /// Fold one result into the alert state and report every edge it caused.
    ///
    /// Results must arrive in increasing frame order; a stale or repeated one is ignored.
    pub fn apply(&self, result: &DetectionResult) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        {
            let mut state = self.state.write();
            if let Some(last) = state.last_frame_seq {
                if result.frame_seq <= last {
                    warn!(
                        frame_seq = result.frame_seq,
                        last_frame_seq = last,
                        "Ignoring out-of-order detection result"
                    );
                    return transitions;
                }
            }

            for (id, outcome) in &result.outcomes {
                let alert = state.detectors.entry(id.clone()).or_default();
                alert.metadata = outcome.metadata.clone();
                if alert.active == outcome.triggered {
                    continue;
                }

                alert.active = outcome.triggered;
                if alert.active {
                    alert.total_count += 1;
                }
                alert.last_transition = Some(result.timestamp);
                transitions.push(AlertTransition {
                    detector: id.clone(),
                    active: alert.active,
                    frame_seq: result.frame_seq,
                    total_count: alert.total_count,
                    at: result.timestamp,
                });
            }

            state.last_frame_seq = Some(result.frame_seq);
            state.results_applied += 1;
            if !transitions.is_empty() {
                state.last_transition = Some(result.timestamp);
            }
        }

        for transition in &transitions {
            let action = if transition.active {
                info!(
                    detector = %transition.detector,
                    frame_seq = transition.frame_seq,
                    total_count = transition.total_count,
                    "Alert raised"
                );
                AuditAction::AlertRaised {
                    detector: transition.detector.clone(),
                    frame_seq: transition.frame_seq,
                    total_count: transition.total_count,
                }
            } else {
                info!(detector = %transition.detector, frame_seq = transition.frame_seq, "Alert cleared");
                AuditAction::AlertCleared {
                    detector: transition.detector.clone(),
                    frame_seq: transition.frame_seq,
                }
            };
            self.audit.record(AuditEvent::new(self.actor.clone(), action));
        }

        transitions
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> AlertState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::detectors::Evaluation;
    use crate::outcome::DetectorOutcome;
    use std::time::Duration;

    fn result(seq: u64, fire: bool) -> DetectionResult {
        let id = DetectorId::from("fire");
        let outcome =
            DetectorOutcome::from_evaluation(id.clone(), Evaluation::triggered(fire), Duration::ZERO);
        DetectionResult {
            frame_seq: seq,
            timestamp: Utc::now(),
            outcomes: [(id, outcome)].into_iter().collect(),
        }
    }

    fn aggregator(sink: Arc<MemoryAuditSink>) -> AlertAggregator {
        AlertAggregator::new([DetectorId::from("fire")], "system", sink)
    }

    #[test]
    fn test_initial_state_is_clear() {
        let agg = aggregator(Arc::new(MemoryAuditSink::new()));
        let state = agg.snapshot();
        assert!(!state.is_active("fire"));
        assert_eq!(state.total_count("fire"), 0);
        assert_eq!(state.last_frame_seq, None);
    }

    #[test]
    fn test_counts_rising_edges_only() {
        let sink = Arc::new(MemoryAuditSink::new());
        let agg = aggregator(sink.clone());

        for (seq, fire) in [false, false, true, true, false, true].iter().enumerate() {
            agg.apply(&result(seq as u64 + 1, *fire));
        }

        let state = agg.snapshot();
        assert!(state.is_active("fire"));
        assert_eq!(state.total_count("fire"), 2);
        assert_eq!(state.results_applied, 6);

        let names: Vec<&str> = sink.actions().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["alert_raised", "alert_cleared", "alert_raised"]);
    }

    #[test]
    fn test_stale_result_is_ignored() {
        let sink = Arc::new(MemoryAuditSink::new());
        let agg = aggregator(sink.clone());

        agg.apply(&result(5, true));
        assert!(agg.apply(&result(5, false)).is_empty());
        assert!(agg.apply(&result(3, false)).is_empty());

        let state = agg.snapshot();
        assert!(state.is_active("fire"));
        assert_eq!(state.last_frame_seq, Some(5));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_transition_carries_count() {
        let agg = aggregator(Arc::new(MemoryAuditSink::new()));
        let transitions = agg.apply(&result(1, true));
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].active);
        assert_eq!(transitions[0].total_count, 1);
        assert_eq!(transitions[0].frame_seq, 1);
    }
}
