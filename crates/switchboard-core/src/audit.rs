//! Append-only audit trail.
//!
//! One JSONL record per decision boundary, joined offline by the
//! per-request correlation id. The recorder never fails the request path:
//! write errors are swallowed after a tracing warning.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

/// One audit record.
#[derive(Debug, Serialize)]
pub struct AuditRecord {
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Joins all records of one request.
    pub correlation_id: String,
    /// Decision boundary, e.g. "auth_reject", "tool_call", "output_screen".
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

/// Shared JSONL audit recorder.
pub struct AuditRecorder {
    file: Mutex<Option<std::fs::File>>,
}

impl AuditRecorder {
    /// Open (append) the audit file; `None` disables persistence but keeps
    /// the tracing side-channel.
    pub fn new(path: Option<&Path>) -> Self {
        let file = path.and_then(|p| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .map_err(|e| {
                    tracing::warn!(event = "audit_open_failed", path = %p.display(), error = %e);
                    e
                })
                .ok()
        });
        Self {
            file: Mutex::new(file),
        }
    }

    /// Recorder that only traces (used in tests and when unconfigured).
    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Append one record.
    pub fn record(&self, correlation_id: &str, event: &str, subject: Option<&str>, detail: Value) {
        tracing::debug!(
            event = event,
            correlation_id = correlation_id,
            subject = subject.unwrap_or("-"),
            "audit"
        );

        let rec = AuditRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.to_string(),
            event: event.to_string(),
            subject: subject.map(str::to_string),
            detail,
        };

        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Some(f) = guard.as_mut() {
            if let Ok(json) = serde_json::to_string(&rec) {
                if writeln!(f, "{}", json).is_err() {
                    tracing::warn!(event = "audit_write_failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_are_newline_delimited_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let recorder = AuditRecorder::new(Some(&path));

        recorder.record("c-1", "auth_ok", Some("user-1"), Value::Null);
        recorder.record("c-1", "tool_call", Some("user-1"), json!({"server": "finance"}));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "auth_ok");
        assert_eq!(first["correlation_id"], "c-1");
        // Null detail is omitted entirely.
        assert!(first.get("detail").is_none());

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["detail"]["server"], "finance");
    }

    #[test]
    fn disabled_recorder_is_silent() {
        let recorder = AuditRecorder::disabled();
        recorder.record("c-2", "auth_reject", None, Value::Null);
    }
}
