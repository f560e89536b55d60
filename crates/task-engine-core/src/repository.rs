//! `TaskRepository`: the storage seam between the engine and Postgres.
//!
//! Grounded on the teacher's adapter pattern (`Adapter` in `adapter.rs`)
//! of putting a thin trait between orchestration logic and the concrete
//! backend, so the engine's scan loop and retry/backoff logic can be
//! exercised against an in-memory fake instead of a live database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use task_engine_db::models::{
    Atomicity, BackoffPolicy, LogEntry, PendingRequest, StepDescriptor, StepResult, Task,
    TaskStatus,
};
use task_engine_db::queries::tasks as db;

use crate::error::EngineError;

/// Storage operations the engine needs against the `tasks` table.
///
/// Every method mirrors a function in `task_engine_db::queries::tasks`;
/// the CAS semantics (row only updates if the current status/lease owner
/// matches) live in the implementation, not the trait.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(
        &self,
        classification: &str,
        atomicity: Atomicity,
        input: serde_json::Value,
        max_attempts: i32,
        backoff: &BackoffPolicy,
        steps: Option<&[StepDescriptor]>,
    ) -> Result<Task, EngineError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, EngineError>;

    async fn list_runnable_tasks(&self, limit: i64) -> Result<Vec<Task>, EngineError>;

    async fn list_expired_leases(&self, limit: i64) -> Result<Vec<Task>, EngineError>;

    async fn claim_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, EngineError>;

    async fn renew_lease(
        &self,
        task_id: Uuid,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, EngineError>;

    async fn start_task(&self, task_id: Uuid, owner: &str) -> Result<u64, EngineError>;

    async fn complete_task(
        &self,
        task_id: Uuid,
        owner: &str,
        output: serde_json::Value,
    ) -> Result<u64, EngineError>;

    async fn fail_task_for_retry(
        &self,
        task_id: Uuid,
        owner: &str,
        error: serde_json::Value,
        next_run_at: DateTime<Utc>,
    ) -> Result<u64, EngineError>;

    async fn fail_task_terminal(
        &self,
        task_id: Uuid,
        owner: &str,
        error: serde_json::Value,
    ) -> Result<u64, EngineError>;

    async fn record_step_result(
        &self,
        task_id: Uuid,
        owner: &str,
        step_results: &[StepResult],
        current_step: i32,
    ) -> Result<u64, EngineError>;

    async fn append_log_entry(
        &self,
        task_id: Uuid,
        entry: &LogEntry,
        max_entries: i64,
    ) -> Result<(), EngineError>;

    async fn set_pending_request(
        &self,
        task_id: Uuid,
        request: &PendingRequest,
    ) -> Result<u64, EngineError>;

    async fn clear_pending_request(&self, task_id: Uuid) -> Result<(), EngineError>;

    /// Apply a pending request at the lease-holder's next observation
    /// point (heartbeat or end of execution), superseding whatever
    /// outcome the lease holder was about to persist. Requires the
    /// caller's lease to still be held; a CAS miss means the lease was
    /// already lost to recovery, in which case there is nothing to apply.
    async fn apply_pending_transition(
        &self,
        task_id: Uuid,
        owner: &str,
        status: TaskStatus,
        scheduled_to: Option<DateTime<Utc>>,
        error: Option<serde_json::Value>,
    ) -> Result<u64, EngineError>;

    async fn cancel_task(&self, task_id: Uuid) -> Result<u64, EngineError>;

    async fn pause_task(&self, task_id: Uuid) -> Result<u64, EngineError>;

    async fn resume_task(
        &self,
        task_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<u64, EngineError>;

    async fn reclaim_expired_lease(&self, task_id: Uuid, owner: &str) -> Result<u64, EngineError>;
}

// Compile-time assertion: TaskRepository must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskRepository) {}
};

/// Production implementation: every method delegates to the matching
/// `task_engine_db::queries::tasks` function over a live `PgPool`.
pub struct PgTaskRepository {
    pool: sqlx::PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn create_task(
        &self,
        classification: &str,
        atomicity: Atomicity,
        input: serde_json::Value,
        max_attempts: i32,
        backoff: &BackoffPolicy,
        steps: Option<&[StepDescriptor]>,
    ) -> Result<Task, EngineError> {
        db::insert_task(&self.pool, classification, atomicity, input, max_attempts, backoff, steps)
            .await
            .map_err(EngineError::repository)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, EngineError> {
        db::get_task(&self.pool, id).await.map_err(EngineError::repository)
    }

    async fn list_runnable_tasks(&self, limit: i64) -> Result<Vec<Task>, EngineError> {
        db::list_runnable_tasks(&self.pool, limit)
            .await
            .map_err(EngineError::repository)
    }

    async fn list_expired_leases(&self, limit: i64) -> Result<Vec<Task>, EngineError> {
        db::list_expired_leases(&self.pool, limit)
            .await
            .map_err(EngineError::repository)
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        db::claim_task(&self.pool, task_id, from, owner, lease_expiry)
            .await
            .map_err(EngineError::repository)
    }

    async fn renew_lease(
        &self,
        task_id: Uuid,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        db::renew_lease(&self.pool, task_id, owner, lease_expiry)
            .await
            .map_err(EngineError::repository)
    }

    async fn start_task(&self, task_id: Uuid, owner: &str) -> Result<u64, EngineError> {
        db::start_task(&self.pool, task_id, owner)
            .await
            .map_err(EngineError::repository)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        owner: &str,
        output: serde_json::Value,
    ) -> Result<u64, EngineError> {
        db::complete_task(&self.pool, task_id, owner, output)
            .await
            .map_err(EngineError::repository)
    }

    async fn fail_task_for_retry(
        &self,
        task_id: Uuid,
        owner: &str,
        error: serde_json::Value,
        next_run_at: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        db::fail_task_for_retry(&self.pool, task_id, owner, error, next_run_at)
            .await
            .map_err(EngineError::repository)
    }

    async fn fail_task_terminal(
        &self,
        task_id: Uuid,
        owner: &str,
        error: serde_json::Value,
    ) -> Result<u64, EngineError> {
        db::fail_task_terminal(&self.pool, task_id, owner, error)
            .await
            .map_err(EngineError::repository)
    }

    async fn record_step_result(
        &self,
        task_id: Uuid,
        owner: &str,
        step_results: &[StepResult],
        current_step: i32,
    ) -> Result<u64, EngineError> {
        db::record_step_result(&self.pool, task_id, owner, step_results, current_step)
            .await
            .map_err(EngineError::repository)
    }

    async fn append_log_entry(
        &self,
        task_id: Uuid,
        entry: &LogEntry,
        max_entries: i64,
    ) -> Result<(), EngineError> {
        db::append_log_entry(&self.pool, task_id, entry, max_entries)
            .await
            .map_err(EngineError::repository)
    }

    async fn set_pending_request(
        &self,
        task_id: Uuid,
        request: &PendingRequest,
    ) -> Result<u64, EngineError> {
        db::set_pending_request(&self.pool, task_id, request)
            .await
            .map_err(EngineError::repository)
    }

    async fn clear_pending_request(&self, task_id: Uuid) -> Result<(), EngineError> {
        db::clear_pending_request(&self.pool, task_id)
            .await
            .map_err(EngineError::repository)
    }

    async fn apply_pending_transition(
        &self,
        task_id: Uuid,
        owner: &str,
        status: TaskStatus,
        scheduled_to: Option<DateTime<Utc>>,
        error: Option<serde_json::Value>,
    ) -> Result<u64, EngineError> {
        db::apply_pending_transition(&self.pool, task_id, owner, status, scheduled_to, error)
            .await
            .map_err(EngineError::repository)
    }

    async fn cancel_task(&self, task_id: Uuid) -> Result<u64, EngineError> {
        db::cancel_task(&self.pool, task_id).await.map_err(EngineError::repository)
    }

    async fn pause_task(&self, task_id: Uuid) -> Result<u64, EngineError> {
        db::pause_task(&self.pool, task_id).await.map_err(EngineError::repository)
    }

    async fn resume_task(
        &self,
        task_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<u64, EngineError> {
        db::resume_task(&self.pool, task_id, next_run_at)
            .await
            .map_err(EngineError::repository)
    }

    async fn reclaim_expired_lease(&self, task_id: Uuid, owner: &str) -> Result<u64, EngineError> {
        db::reclaim_expired_lease(&self.pool, task_id, owner)
            .await
            .map_err(EngineError::repository)
    }
}

/// In-memory fake, faithful to the same CAS semantics as the Postgres
/// queries it stands in for. Used by engine unit tests so lifecycle logic
/// can be exercised without a database.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task built by the caller verbatim (tests construct
    /// `Task` values directly rather than going through `create_task`,
    /// which only fills in server-side defaults).
    pub fn insert(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id, task);
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, Task>) -> R) -> R {
        let mut guard = self.tasks.lock().unwrap();
        f(&mut guard)
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create_task(
        &self,
        classification: &str,
        atomicity: Atomicity,
        input: serde_json::Value,
        max_attempts: i32,
        backoff: &BackoffPolicy,
        steps: Option<&[StepDescriptor]>,
    ) -> Result<Task, EngineError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            classification: classification.to_string(),
            atomicity,
            status: TaskStatus::Created,
            input,
            output: None,
            error: None,
            attempt: 0,
            max_attempts,
            backoff: backoff.clone(),
            next_run_at: None,
            lease_owner: None,
            lease_expiry: None,
            steps: steps.map(|s| s.to_vec()),
            step_results: Vec::new(),
            current_step: 0,
            log_tail: Vec::new(),
            pending_request: None,
            created_at: now,
            updated_at: now,
        };
        self.insert(task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, EngineError> {
        Ok(self.with_lock(|tasks| tasks.get(&id).cloned()))
    }

    async fn list_runnable_tasks(&self, limit: i64) -> Result<Vec<Task>, EngineError> {
        Ok(self.with_lock(|tasks| {
            let mut runnable: Vec<Task> = tasks
                .values()
                .filter(|t| {
                    TaskStatus::RUNNABLE.contains(&t.status)
                        && t.next_run_at.is_none_or(|at| at <= Utc::now())
                })
                .cloned()
                .collect();
            // `next_run_at ASC NULLS FIRST, id ASC`, matching
            // `queries::tasks::list_runnable_tasks`'s ORDER BY -- `Option`'s
            // derived `Ord` already sorts `None` before `Some`, giving us
            // NULLS FIRST for free.
            runnable.sort_by_key(|t| (t.next_run_at, t.id));
            runnable.truncate(limit.max(0) as usize);
            runnable
        }))
    }

    async fn list_expired_leases(&self, limit: i64) -> Result<Vec<Task>, EngineError> {
        Ok(self.with_lock(|tasks| {
            let mut expired: Vec<Task> = tasks
                .values()
                .filter(|t| {
                    TaskStatus::LEASED.contains(&t.status)
                        && t.lease_expiry.is_some_and(|exp| exp < Utc::now())
                })
                .cloned()
                .collect();
            expired.sort_by_key(|t| t.lease_expiry);
            expired.truncate(limit.max(0) as usize);
            expired
        }))
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t) if t.status == from => {
                t.status = TaskStatus::Claimed;
                t.lease_owner = Some(owner.to_string());
                t.lease_expiry = Some(lease_expiry);
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn renew_lease(
        &self,
        task_id: Uuid,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner)
                    && TaskStatus::LEASED.contains(&t.status) =>
            {
                t.lease_expiry = Some(lease_expiry);
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn start_task(&self, task_id: Uuid, owner: &str) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner) && t.status == TaskStatus::Claimed =>
            {
                t.status = TaskStatus::Running;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        owner: &str,
        output: serde_json::Value,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner) && t.status == TaskStatus::Running =>
            {
                t.status = TaskStatus::Succeeded;
                t.output = Some(output);
                t.lease_owner = None;
                t.lease_expiry = None;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn fail_task_for_retry(
        &self,
        task_id: Uuid,
        owner: &str,
        error: serde_json::Value,
        next_run_at: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner) && t.status == TaskStatus::Running =>
            {
                t.status = TaskStatus::WaitingRetry;
                t.error = Some(error);
                t.attempt += 1;
                t.next_run_at = Some(next_run_at);
                t.lease_owner = None;
                t.lease_expiry = None;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn fail_task_terminal(
        &self,
        task_id: Uuid,
        owner: &str,
        error: serde_json::Value,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner) && t.status == TaskStatus::Running =>
            {
                t.status = TaskStatus::Failed;
                t.error = Some(error);
                t.attempt += 1;
                t.lease_owner = None;
                t.lease_expiry = None;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn record_step_result(
        &self,
        task_id: Uuid,
        owner: &str,
        step_results: &[StepResult],
        current_step: i32,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner) && t.status == TaskStatus::Running =>
            {
                t.step_results = step_results.to_vec();
                t.current_step = current_step;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn append_log_entry(
        &self,
        task_id: Uuid,
        entry: &LogEntry,
        max_entries: i64,
    ) -> Result<(), EngineError> {
        self.with_lock(|tasks| {
            if let Some(t) = tasks.get_mut(&task_id) {
                t.log_tail.push(entry.clone());
                let keep_from = t.log_tail.len().saturating_sub(max_entries.max(0) as usize);
                t.log_tail = t.log_tail.split_off(keep_from);
            }
        });
        Ok(())
    }

    async fn set_pending_request(
        &self,
        task_id: Uuid,
        request: &PendingRequest,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t) if !t.status.is_terminal() => {
                t.pending_request = Some(request.clone());
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn clear_pending_request(&self, task_id: Uuid) -> Result<(), EngineError> {
        self.with_lock(|tasks| {
            if let Some(t) = tasks.get_mut(&task_id) {
                t.pending_request = None;
                t.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn apply_pending_transition(
        &self,
        task_id: Uuid,
        owner: &str,
        status: TaskStatus,
        scheduled_to: Option<DateTime<Utc>>,
        error: Option<serde_json::Value>,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner)
                    && TaskStatus::LEASED.contains(&t.status) =>
            {
                t.status = status;
                t.lease_owner = None;
                t.lease_expiry = None;
                t.pending_request = None;
                if let Some(error) = error {
                    t.error = Some(error);
                }
                if let Some(at) = scheduled_to {
                    t.next_run_at = Some(at);
                }
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn cancel_task(&self, task_id: Uuid) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t) if !t.status.is_terminal() => {
                t.status = TaskStatus::Canceled;
                t.lease_owner = None;
                t.lease_expiry = None;
                t.pending_request = None;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn pause_task(&self, task_id: Uuid) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t) if TaskStatus::RUNNABLE.contains(&t.status) => {
                t.status = TaskStatus::Paused;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn resume_task(
        &self,
        task_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t) if t.status == TaskStatus::Paused => {
                t.status = TaskStatus::Scheduled;
                if let Some(at) = next_run_at {
                    t.next_run_at = Some(at);
                }
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }

    async fn reclaim_expired_lease(&self, task_id: Uuid, owner: &str) -> Result<u64, EngineError> {
        Ok(self.with_lock(|tasks| match tasks.get_mut(&task_id) {
            Some(t)
                if t.lease_owner.as_deref() == Some(owner)
                    && TaskStatus::LEASED.contains(&t.status)
                    && t.lease_expiry.is_some_and(|exp| exp < Utc::now()) =>
            {
                t.status = TaskStatus::Scheduled;
                t.lease_owner = None;
                t.lease_expiry = None;
                t.updated_at = Utc::now();
                1
            }
            _ => 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            classification: "demo".to_string(),
            atomicity: Atomicity::Simple,
            status,
            input: serde_json::json!({}),
            output: None,
            error: None,
            attempt: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            next_run_at: None,
            lease_owner: None,
            lease_expiry: None,
            steps: None,
            step_results: Vec::new(),
            current_step: 0,
            log_tail: Vec::new(),
            pending_request: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn claim_is_cas_and_rejects_wrong_from_status() {
        let repo = InMemoryTaskRepository::new();
        let task = sample_task(TaskStatus::Created);
        let id = task.id;
        repo.insert(task);

        let rows = repo
            .claim_task(id, TaskStatus::Scheduled, "worker-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(rows, 0);

        let rows = repo
            .claim_task(id, TaskStatus::Created, "worker-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(repo.get_task(id).await.unwrap().unwrap().status, TaskStatus::Claimed);
    }

    #[tokio::test]
    async fn complete_requires_matching_lease_owner() {
        let repo = InMemoryTaskRepository::new();
        let mut task = sample_task(TaskStatus::Running);
        task.lease_owner = Some("worker-1".to_string());
        let id = task.id;
        repo.insert(task);

        let rows = repo.complete_task(id, "worker-2", serde_json::json!({})).await.unwrap();
        assert_eq!(rows, 0);

        let rows = repo.complete_task(id, "worker-1", serde_json::json!({"ok": true})).await.unwrap();
        assert_eq!(rows, 1);
        let saved = repo.get_task(id).await.unwrap().unwrap();
        assert_eq!(saved.status, TaskStatus::Succeeded);
        assert_eq!(saved.output, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn list_runnable_respects_next_run_at() {
        let repo = InMemoryTaskRepository::new();
        let mut future_task = sample_task(TaskStatus::WaitingRetry);
        future_task.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        repo.insert(future_task);

        let ready_task = sample_task(TaskStatus::Created);
        repo.insert(ready_task);

        let runnable = repo.list_runnable_tasks(10).await.unwrap();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].status, TaskStatus::Created);
    }

    #[tokio::test]
    async fn list_runnable_orders_by_next_run_at_not_created_at() {
        let repo = InMemoryTaskRepository::new();

        // Older task, but its retry delay pushes next_run_at into the future.
        let mut retried = sample_task(TaskStatus::WaitingRetry);
        retried.created_at = Utc::now() - chrono::Duration::hours(1);
        retried.next_run_at = Some(Utc::now() - chrono::Duration::seconds(30));
        let retried_id = retried.id;
        repo.insert(retried);

        // Newer task with no next_run_at (NULLS FIRST) should still come first.
        let mut fresh = sample_task(TaskStatus::Created);
        fresh.created_at = Utc::now();
        fresh.next_run_at = None;
        let fresh_id = fresh.id;
        repo.insert(fresh);

        let runnable = repo.list_runnable_tasks(10).await.unwrap();
        assert_eq!(runnable.len(), 2);
        assert_eq!(runnable[0].id, fresh_id);
        assert_eq!(runnable[1].id, retried_id);
    }

    #[tokio::test]
    async fn cancel_rejected_on_terminal_task() {
        let repo = InMemoryTaskRepository::new();
        let task = sample_task(TaskStatus::Succeeded);
        let id = task.id;
        repo.insert(task);

        let rows = repo.cancel_task(id).await.unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn append_log_entry_truncates_to_max() {
        let repo = InMemoryTaskRepository::new();
        let task = sample_task(TaskStatus::Running);
        let id = task.id;
        repo.insert(task);

        for i in 0..5 {
            let entry = LogEntry {
                level: task_engine_db::models::LogLevel::Info,
                message: format!("msg {i}"),
                extra: None,
                recorded_at: Utc::now(),
            };
            repo.append_log_entry(id, &entry, 3).await.unwrap();
        }

        let saved = repo.get_task(id).await.unwrap().unwrap();
        assert_eq!(saved.log_tail.len(), 3);
        assert_eq!(saved.log_tail.last().unwrap().message, "msg 4");
    }
}
