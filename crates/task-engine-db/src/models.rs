use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Scheduled,
    Claimed,
    Running,
    WaitingRetry,
    Succeeded,
    Failed,
    Canceled,
    Paused,
}

impl TaskStatus {
    /// Statuses from which a task is eligible for the scan loop.
    pub const RUNNABLE: [TaskStatus; 3] = [
        TaskStatus::Created,
        TaskStatus::Scheduled,
        TaskStatus::WaitingRetry,
    ];

    /// Statuses that hold a live lease and are therefore subject to
    /// lease-expiry recovery.
    pub const LEASED: [TaskStatus; 2] = [TaskStatus::Claimed, TaskStatus::Running];

    /// `true` for SUCCEEDED/FAILED/CANCELED.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::WaitingRetry => "waiting_retry",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "scheduled" => Ok(Self::Scheduled),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "waiting_retry" => Ok(Self::WaitingRetry),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "paused" => Ok(Self::Paused),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Whether a task is a single handler invocation or an ordered sequence of
/// steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    Simple,
    Composite,
}

impl fmt::Display for Atomicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Composite => "composite",
        };
        f.write_str(s)
    }
}

impl FromStr for Atomicity {
    type Err = AtomicityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "composite" => Ok(Self::Composite),
            other => Err(AtomicityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Atomicity`] string.
#[derive(Debug, Clone)]
pub struct AtomicityParseError(pub String);

impl fmt::Display for AtomicityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid atomicity: {:?}", self.0)
    }
}

impl std::error::Error for AtomicityParseError {}

// ---------------------------------------------------------------------------

/// Retry backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        base_ms: i64,
    },
    Exponential {
        base_ms: i64,
        factor: f64,
        cap_ms: i64,
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 1_000,
            factor: 2.0,
            cap_ms: 60_000,
            jitter: false,
        }
    }
}

// ---------------------------------------------------------------------------

/// The outcome requested for a task transition that bypasses ordinary
/// retry accounting: a handler-thrown state change, or an operator's
/// explicit cancel/pause/resume call.
///
/// Stored verbatim on `Task::pending_request` and applied atomically the
/// next time the engine observes the task (claim, heartbeat, or end of
/// execution) -- this is how external requests and handler state changes
/// share one mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub status: RequestedStatus,
    pub scheduled_to: Option<DateTime<Utc>>,
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedStatus {
    Canceled,
    Paused,
    Scheduled,
}

// ---------------------------------------------------------------------------

/// A single step of a composite task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    /// Handler classification for this step; defaults to the parent
    /// task's classification when absent.
    pub classification: Option<String>,
    pub input: serde_json::Value,
}

/// The recorded outcome of one composite step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepOutcome,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

/// A single entry in a task's bounded log tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub extra: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Serialized error shape used for `Task::error` and the worker wire
/// protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub code: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            name: "HandlerError".to_string(),
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
            code: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Row struct
// ---------------------------------------------------------------------------

/// A task -- the persistent unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub classification: String,
    pub atomicity: Atomicity,
    pub status: TaskStatus,

    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,

    pub attempt: i32,
    pub max_attempts: i32,
    #[sqlx(json)]
    pub backoff: BackoffPolicy,

    pub next_run_at: Option<DateTime<Utc>>,

    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,

    #[sqlx(json)]
    pub steps: Option<Vec<StepDescriptor>>,
    #[sqlx(json)]
    pub step_results: Vec<StepResult>,
    pub current_step: i32,

    #[sqlx(json)]
    pub log_tail: Vec<LogEntry>,

    #[sqlx(json)]
    pub pending_request: Option<PendingRequest>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The index of the next unfinished step, or `steps.len()` once all
    /// steps have succeeded.
    pub fn is_composite_complete(&self) -> bool {
        match &self.steps {
            Some(steps) => self.current_step as usize >= steps.len(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Created,
            TaskStatus::Scheduled,
            TaskStatus::Claimed,
            TaskStatus::Running,
            TaskStatus::WaitingRetry,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::Paused,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_is_terminal() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn atomicity_display_roundtrip() {
        for v in [Atomicity::Simple, Atomicity::Composite] {
            assert_eq!(v.to_string().parse::<Atomicity>().unwrap(), v);
        }
    }

    #[test]
    fn backoff_policy_serde_roundtrip() {
        let fixed = BackoffPolicy::Fixed { base_ms: 500 };
        let json = serde_json::to_string(&fixed).unwrap();
        let back: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(fixed, back);

        let expo = BackoffPolicy::Exponential {
            base_ms: 100,
            factor: 2.0,
            cap_ms: 1000,
            jitter: true,
        };
        let json = serde_json::to_string(&expo).unwrap();
        let back: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(expo, back);
    }
}
