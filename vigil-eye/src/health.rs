//! Detector health tracking
//!
//! Consecutive timeouts or consecutive failures past the configured threshold mark a
//! detector degraded and emit one `detector_degraded` event. The next clean outcome
//! clears the flag and emits `detector_recovered`.

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::detectors::DetectorId;
use crate::outcome::DetectionResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorHealth {
    pub consecutive_timeouts: u32,
    pub consecutive_failures: u32,
    pub total_timeouts: u64,
    pub total_failures: u64,
    pub evaluations: u64,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_elapsed_ms: Option<u64>,
}

pub struct HealthMonitor {
    threshold: u32,
    actor: String,
    audit: Arc<dyn AuditSink>,
    state: RwLock<BTreeMap<DetectorId, DetectorHealth>>,
}

impl HealthMonitor {
    pub fn new(
        detectors: impl IntoIterator<Item = DetectorId>,
        threshold: u32,
        actor: impl Into<String>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            threshold: threshold.max(1),
            actor: actor.into(),
            audit,
            state: RwLock::new(
                detectors
                    .into_iter()
                    .map(|id| (id, DetectorHealth::default()))
                    .collect(),
            ),
        }
    }

    /// Fold one dispatch result into the per-detector counters
    pub fn observe(&self, result: &DetectionResult) {
        let mut transitions = Vec::new();
        {
            let mut state = self.state.write();
            for (id, outcome) in &result.outcomes {
                let health = state.entry(id.clone()).or_default();
                health.evaluations += 1;
                health.last_elapsed_ms = Some(outcome.elapsed_ms);

                match &outcome.error {
                    None => {
                        health.consecutive_timeouts = 0;
                        health.consecutive_failures = 0;
                        if health.degraded {
                            health.degraded = false;
                            transitions.push(AuditAction::DetectorRecovered {
                                detector: id.clone(),
                            });
                        }
                        continue;
                    }
                    Some(err) if err.is_timeout() => {
                        health.consecutive_timeouts += 1;
                        health.consecutive_failures = 0;
                        health.total_timeouts += 1;
                    }
                    Some(_) => {
                        health.consecutive_failures += 1;
                        health.consecutive_timeouts = 0;
                        health.total_failures += 1;
                    }
                }

                let reason = outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                health.last_error = Some(reason.clone());

                if !health.degraded
                    && (health.consecutive_timeouts >= self.threshold
                        || health.consecutive_failures >= self.threshold)
                {
                    health.degraded = true;
                    transitions.push(AuditAction::DetectorDegraded {
                        detector: id.clone(),
                        reason: format!("{} consecutive: {}", self.threshold, reason),
                    });
                }
            }
        }

        for action in transitions {
            match &action {
                AuditAction::DetectorDegraded { detector, reason } => {
                    error!(detector = %detector, frame_seq = result.frame_seq, "Detector degraded: {}", reason)
                }
                AuditAction::DetectorRecovered { detector } => {
                    info!(detector = %detector, frame_seq = result.frame_seq, "Detector recovered")
                }
                _ => {}
            }
            self.audit.record(AuditEvent::new(self.actor.clone(), action));
        }
    }

    pub fn snapshot(&self) -> BTreeMap<DetectorId, DetectorHealth> {
        self.state.read().clone()
    }

    pub fn degraded(&self) -> Vec<DetectorId> {
        self.state
            .read()
            .iter()
            .filter(|(_, h)| h.degraded)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::detectors::Evaluation;
    use crate::outcome::{DetectorOutcome, OutcomeError};
    use chrono::Utc;
    use std::time::Duration;

    fn result(seq: u64, error: Option<OutcomeError>) -> DetectionResult {
        let id = DetectorId::from("fall");
        let outcome = match error {
            Some(err) => DetectorOutcome::degraded(id.clone(), err, Duration::from_millis(5)),
            None => DetectorOutcome::from_evaluation(
                id.clone(),
                Evaluation::triggered(false),
                Duration::from_millis(5),
            ),
        };
        DetectionResult {
            frame_seq: seq,
            timestamp: Utc::now(),
            outcomes: [(id, outcome)].into_iter().collect(),
        }
    }

    fn monitor(sink: Arc<MemoryAuditSink>) -> HealthMonitor {
        HealthMonitor::new([DetectorId::from("fall")], 3, "system", sink)
    }

    #[test]
    fn test_three_timeouts_emit_one_degraded_event() {
        let sink = Arc::new(MemoryAuditSink::new());
        let health = monitor(sink.clone());

        for seq in 1..=5 {
            health.observe(&result(seq, Some(OutcomeError::TimedOut { after_ms: 100 })));
            if seq < 3 {
                assert!(sink.is_empty());
            }
        }

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.actions()[0].name(), "detector_degraded");
        assert_eq!(health.degraded(), vec![DetectorId::from("fall")]);
        assert_eq!(health.snapshot()[&DetectorId::from("fall")].total_timeouts, 5);
    }

    #[test]
    fn test_interrupted_timeouts_do_not_degrade() {
        let sink = Arc::new(MemoryAuditSink::new());
        let health = monitor(sink.clone());

        health.observe(&result(1, Some(OutcomeError::TimedOut { after_ms: 100 })));
        health.observe(&result(2, Some(OutcomeError::Busy)));
        health.observe(&result(3, None));
        health.observe(&result(4, Some(OutcomeError::TimedOut { after_ms: 100 })));
        health.observe(&result(5, Some(OutcomeError::TimedOut { after_ms: 100 })));

        assert!(sink.is_empty());
        assert!(health.degraded().is_empty());
    }

    #[test]
    fn test_recovery_after_degraded() {
        let sink = Arc::new(MemoryAuditSink::new());
        let health = monitor(sink.clone());

        for seq in 1..=3 {
            health.observe(&result(
                seq,
                Some(OutcomeError::Failed {
                    message: "model error".to_string(),
                }),
            ));
        }
        health.observe(&result(4, None));

        let names: Vec<&str> = sink.actions().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["detector_degraded", "detector_recovered"]);
        assert!(health.degraded().is_empty());
    }
}
