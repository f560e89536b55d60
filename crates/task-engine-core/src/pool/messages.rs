//! The worker wire protocol.
//!
//! Messages are JSON-serializable on purpose even though today's workers
//! are OS threads inside the same process talking over `std::sync::mpsc`:
//! keeping the contract serde-round-trippable means a real IPC transport
//! (a subprocess, a socket) is a drop-in replacement for the channel pair
//! without touching a single call site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::BufferedLogEntry;
use crate::handler::StateChangeRequest;

/// Host -> worker control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Stop,
    Shutdown,
}

/// The job payload carried by an `execute` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJobPayload {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub classification: String,
    pub input: Value,
    pub attempt: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_cache: Option<std::collections::HashMap<String, Value>>,
    pub stream_buffer_size: usize,
    pub max_logging_buffer: usize,
    pub logging_buffer_truncation: usize,
}

/// Host -> worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Control { command: ControlCommand },
    Execute { job: WorkerJobPayload },
}

/// Worker -> host messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent exactly once, before the worker accepts any `execute` message.
    Ready { worker_id: Uuid },
    Log { job_id: Uuid, entries: Vec<LogEntryWire> },
    Progress { job_id: Uuid, payload: Value },
    Heartbeat { job_id: Uuid },
    Result {
        job_id: Uuid,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_cache: Option<std::collections::HashMap<String, Value>>,
    },
    /// A handler error (normal failure, subject to retry accounting) or a
    /// state-change request forwarded verbatim from the handler.
    Error {
        job_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_change: Option<StateChangeRequest>,
    },
    /// The worker is exiting on its own, outside of a requested shutdown
    /// (panic caught at the thread boundary, or an unrecoverable setup
    /// failure). The pool treats this exactly like a crash.
    Exited { worker_id: Uuid, reason: String },
}

/// Wire-safe representation of a buffered log entry (the in-memory
/// `BufferedLogEntry` carries a `LogLevel` with no serde derive today, so
/// the wire form stores the level as a plain string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryWire {
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl From<&BufferedLogEntry> for LogEntryWire {
    fn from(entry: &BufferedLogEntry) -> Self {
        let level = match entry.level {
            crate::context::LogLevel::Trace => "trace",
            crate::context::LogLevel::Debug => "debug",
            crate::context::LogLevel::Info => "info",
            crate::context::LogLevel::Warn => "warn",
            crate::context::LogLevel::Error => "error",
        };
        Self {
            level: level.to_string(),
            message: entry.message.clone(),
            extra: entry.extra.clone(),
            recorded_at: entry.recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_message_execute_round_trips() {
        let msg = HostMessage::Execute {
            job: WorkerJobPayload {
                job_id: Uuid::nil(),
                task_id: Uuid::nil(),
                classification: "demo".to_string(),
                input: serde_json::json!({"x": 1}),
                attempt: 1,
                result_cache: None,
                stream_buffer_size: 20,
                max_logging_buffer: 1000,
                logging_buffer_truncation: 100,
            },
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: HostMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            HostMessage::Execute { job } => assert_eq!(job.classification, "demo"),
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn control_command_serializes_snake_case() {
        let msg = HostMessage::Control {
            command: ControlCommand::Shutdown,
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"shutdown\""));
    }

    #[test]
    fn worker_ready_round_trips() {
        let id = Uuid::nil();
        let msg = WorkerMessage::Ready { worker_id: id };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: WorkerMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            WorkerMessage::Ready { worker_id } => assert_eq!(worker_id, id),
            _ => panic!("expected ready"),
        }
    }
}
