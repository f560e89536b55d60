//! The engine's error taxonomy.
//!
//! Every kind named in the task lifecycle design has a variant here so
//! callers can match on it instead of stringly-typed causes. `EngineError`
//! sits at crate boundaries; call sites that aggregate several failure
//! sources use `anyhow::Result` as the teacher crate does.

use task_engine_db::models::TaskStatus;
use uuid::Uuid;

/// Errors raised by the engine loop, the per-task state machine, and the
/// worker pool.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A handler returned an error and no state change was requested.
    #[error("handler error for task {task_id}: {message}")]
    Handler { task_id: Uuid, message: String },

    /// Another worker already holds a live lease on this task.
    #[error("claim conflict on task {0}: lease already held")]
    ClaimConflict(Uuid),

    /// The task repository returned an unexpected error.
    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    /// Acquiring a table or record lock did not complete within the
    /// caller-supplied deadline.
    #[error("lock timeout acquiring resource {resource}")]
    LockTimeout { resource: String },

    /// A worker process exited while a job was still in flight. The job
    /// is re-enqueued; this variant is informational (logged, not fatal).
    #[error("worker {worker_id} terminated with job {job_id} in flight")]
    WorkerTerminated { worker_id: Uuid, job_id: Uuid },

    /// A queued or in-flight job was rejected because the pool is shutting
    /// down.
    #[error("job {0} rejected: pool is shutting down")]
    ShutdownRejected(Uuid),

    /// Invalid engine or pool configuration; fatal at `start`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A task transition was requested that the state graph does not
    /// allow (e.g. claiming a task that is already terminal).
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// No handler is registered under the task's classification.
    #[error("no handler registered for classification {0:?}")]
    UnknownClassification(String),
}

impl EngineError {
    pub fn repository(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Repository(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_task_id() {
        let id = Uuid::nil();
        let err = EngineError::ClaimConflict(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn invalid_transition_message() {
        let err = EngineError::InvalidTransition {
            task_id: Uuid::nil(),
            from: TaskStatus::Succeeded,
            to: TaskStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("succeeded"));
        assert!(msg.contains("running"));
    }
}
