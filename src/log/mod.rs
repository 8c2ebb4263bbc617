//! Structured monitor log — JSON lines per operation.
//!
//! Each monitoring run can append its lifecycle to a `.jsonl` file: phase
//! transitions, decode attempts, and the terminal outcome. Each line is a
//! self-contained JSON object carrying a timestamp and the operation id,
//! making logs easy to grep, stream, and post-process when a wait behaved
//! unexpectedly.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// A structured event in the monitor log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Operation this entry belongs to.
    pub operation: Uuid,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: MonitorEvent,
}

/// All event types that can appear in the monitor log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A monitoring operation began.
    OperationStarted {
        kind: String,
        project: String,
        triggered_at_epoch_secs: u64,
    },
    /// DerivedData was resolved for the project.
    DerivedDataLocated { path: String },
    /// A fresh artifact (newer than the trigger) was observed.
    FreshArtifactObserved { path: String },
    /// A readiness/stability phase was entered.
    PhaseEntered { phase: String },
    /// The staging marker outlived its patience; continuing best-effort.
    StagingOverrun { waited_secs: u64 },
    /// The artifact never stabilized; decoding best-effort.
    StabilityTimeout { waited_secs: u64 },
    /// One decoder invocation finished.
    DecodeAttempt { attempt: u32, outcome: String },
    /// One verified-read attempt finished.
    ValidationAttempt { attempt: u32, ready: bool },
    /// The operation produced a result.
    OperationCompleted { outcome: String },
    /// The operation ended without a result.
    OperationFailed { classification: String },
}

/// Writer for JSON lines monitor logs.
pub struct MonitorLog {
    writer: Mutex<BufWriter<File>>,
    operation: Uuid,
    #[allow(dead_code)]
    path: PathBuf,
}

impl MonitorLog {
    /// Open (or create) the log file and mint a fresh operation id.
    ///
    /// Appends to an existing file; creates parent directories as needed.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            operation: Uuid::new_v4(),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: MonitorEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: self.operation,
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "monitor log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Get the path to the log file.
    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Best-effort logging sink: a missing log config means events are dropped,
/// and a write failure never aborts the monitoring operation itself.
pub struct EventSink {
    log: Option<MonitorLog>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self { log: None }
    }

    pub fn to_file(path: &Path) -> Result<Self> {
        Ok(Self {
            log: Some(MonitorLog::new(path)?),
        })
    }

    pub fn emit(&self, event: MonitorEvent) {
        if let Some(log) = &self.log {
            if let Err(err) = log.log(event) {
                debug!(error = %err, "monitor log write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_one_json_line_per_event() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("monitor.jsonl");
        let log = MonitorLog::new(&path).unwrap();

        log.log(MonitorEvent::OperationStarted {
            kind: "build".to_string(),
            project: "/w/Foo.xcodeproj".to_string(),
            triggered_at_epoch_secs: 1_700_000_000,
        })
        .unwrap();
        log.log(MonitorEvent::PhaseEntered {
            phase: "size-stabilize".to_string(),
        })
        .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "operation_started");
        assert_eq!(first["data"]["kind"], "build");
        assert!(first["timestamp"].is_string());
        assert!(first["operation"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "phase_entered");
        assert_eq!(second["data"]["phase"], "size-stabilize");
        // Same operation id on every line of a run.
        assert_eq!(first["operation"], second["operation"]);
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deep").join("nested").join("monitor.jsonl");
        let log = MonitorLog::new(&path).unwrap();
        log.log(MonitorEvent::OperationCompleted {
            outcome: "decoded".to_string(),
        })
        .unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("monitor.jsonl");

        for _ in 0..2 {
            let log = MonitorLog::new(&path).unwrap();
            log.log(MonitorEvent::OperationCompleted {
                outcome: "decoded".to_string(),
            })
            .unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn disabled_sink_swallows_events() {
        let sink = EventSink::disabled();
        sink.emit(MonitorEvent::PhaseEntered {
            phase: "staging".to_string(),
        });
    }

    #[test]
    fn sink_writes_through_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("monitor.jsonl");
        let sink = EventSink::to_file(&path).unwrap();
        sink.emit(MonitorEvent::ValidationAttempt {
            attempt: 2,
            ready: true,
        });
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("validation_attempt"));
    }
}
