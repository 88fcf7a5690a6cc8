//! Audit events and sinks
//!
//! Recording is fire-and-forget: a sink that cannot persist an event logs the failure
//! and carries on. Nothing here returns an error to the pipeline.

use crate::detectors::DetectorId;
use crate::error::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditAction {
    MonitoringStarted { source: String },
    MonitoringStopped { reason: String },
    CaptureFailed { message: String },
    AlertRaised {
        detector: DetectorId,
        frame_seq: u64,
        total_count: u64,
    },
    AlertCleared { detector: DetectorId, frame_seq: u64 },
    DetectorDegraded { detector: DetectorId, reason: String },
    DetectorRecovered { detector: DetectorId },
}

impl AuditAction {
    pub fn name(&self) -> &'static str {
        match self {
            AuditAction::MonitoringStarted { .. } => "monitoring_started",
            AuditAction::MonitoringStopped { .. } => "monitoring_stopped",
            AuditAction::CaptureFailed { .. } => "capture_failed",
            AuditAction::AlertRaised { .. } => "alert_raised",
            AuditAction::AlertCleared { .. } => "alert_cleared",
            AuditAction::DetectorDegraded { .. } => "detector_degraded",
            AuditAction::DetectorRecovered { .. } => "detector_recovered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub action: AuditAction,
}

impl AuditEvent {
    pub fn new(actor: impl Into<String>, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            timestamp: Utc::now(),
            action,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the `vigil::audit` tracing target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(
                target: "vigil::audit",
                actor = %event.actor,
                action = event.action.name(),
                "{}",
                json
            ),
            Err(e) => warn!(target: "vigil::audit", "Failed to serialize audit event: {}", e),
        }
    }
}

/// Keeps events in memory, for tests and the status endpoint
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events.lock().iter().map(|e| e.action.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Appends one JSON object per line from a background writer thread
pub struct JsonLinesAuditSink {
    path: PathBuf,
    sender: Option<Sender<AuditEvent>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonLinesAuditSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (sender, receiver) = unbounded::<AuditEvent>();

        let thread_path = path.clone();
        let writer = std::thread::Builder::new()
            .name("vigil-audit".to_string())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for event in receiver {
                    let written = serde_json::to_writer(&mut out, &event)
                        .map_err(std::io::Error::from)
                        .and_then(|_| out.write_all(b"\n"))
                        .and_then(|_| out.flush());
                    if let Err(e) = written {
                        warn!("Failed to append audit event to {}: {}", thread_path.display(), e);
                    }
                }
                debug!("Audit writer for {} stopped", thread_path.display());
            })?;

        Ok(Self {
            path,
            sender: Some(sender),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, event: AuditEvent) {
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(event).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!("Audit writer for {} is gone; event dropped", self.path.display());
        }
    }
}

impl Drop for JsonLinesAuditSink {
    fn drop(&mut self) {
        // flushes the remaining queue before the thread exits
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("Audit writer for {} panicked", self.path.display());
            }
        }
    }
}

/// Forwards every event to each inner sink
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_event_serializes_flat_with_action_tag() {
        let event = AuditEvent::new(
            "operator",
            AuditAction::AlertRaised {
                detector: DetectorId::from("fire"),
                frame_seq: 5,
                total_count: 1,
            },
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "alert_raised");
        assert_eq!(json["detector"], "fire");
        assert_eq!(json["frame_seq"], 5);
        assert_eq!(json["actor"], "operator");
        assert!(json["timestamp"].is_string());

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::new(
            "system",
            AuditAction::MonitoringStopped {
                reason: "stopped".to_string(),
            },
        ));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.actions()[0].name(), "monitoring_stopped");
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let sink = JsonLinesAuditSink::create(&path).unwrap();
            sink.record(AuditEvent::new(
                "system",
                AuditAction::MonitoringStarted {
                    source: "synthetic".to_string(),
                },
            ));
            sink.record(AuditEvent::new(
                "system",
                AuditAction::DetectorRecovered {
                    detector: DetectorId::from("crowd"),
                },
            ));
        }
        {
            let sink = JsonLinesAuditSink::create(&path).unwrap();
            sink.record(AuditEvent::new(
                "system",
                AuditAction::CaptureFailed {
                    message: "unplugged".to_string(),
                },
            ));
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let actions: Vec<String> = content
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["action"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            actions,
            vec!["monitoring_started", "detector_recovered", "capture_failed"]
        );
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new(vec![a.clone() as Arc<dyn AuditSink>, b.clone()]);
        fanout.record(AuditEvent::new(
            "system",
            AuditAction::MonitoringStopped {
                reason: "end_of_stream".to_string(),
            },
        ));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
