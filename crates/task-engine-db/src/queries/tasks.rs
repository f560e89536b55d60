//! Database query functions for the `tasks` table: the task repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    Atomicity, BackoffPolicy, LogEntry, PendingRequest, StepDescriptor, StepResult, Task,
    TaskStatus,
};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, updated_at, status = created, attempt = 0).
pub async fn insert_task(
    pool: &PgPool,
    classification: &str,
    atomicity: Atomicity,
    input: serde_json::Value,
    max_attempts: i32,
    backoff: &BackoffPolicy,
    steps: Option<&[StepDescriptor]>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (classification, atomicity, input, max_attempts, backoff, steps) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(classification)
    .bind(atomicity)
    .bind(input)
    .bind(max_attempts)
    .bind(sqlx::types::Json(backoff))
    .bind(steps.map(sqlx::types::Json))
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks that are runnable right now: status in (created, scheduled,
/// waiting_retry) and, when set, `next_run_at <= now()`. Ordered oldest
/// first so the scan loop is roughly FIFO. Limited to `limit` rows so a
/// single scan pass cannot starve the connection pool.
pub async fn list_runnable_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('created', 'scheduled', 'waiting_retry') \
           AND (next_run_at IS NULL OR next_run_at <= NOW()) \
         ORDER BY next_run_at ASC NULLS FIRST, id ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list runnable tasks")?;

    Ok(tasks)
}

/// List tasks whose lease has expired: status in (claimed, running) and
/// `lease_expiry < now()`. These are recovery candidates for the scan loop.
pub async fn list_expired_leases(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('claimed', 'running') \
           AND lease_expiry IS NOT NULL AND lease_expiry < NOW() \
         ORDER BY lease_expiry ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list tasks with expired leases")?;

    Ok(tasks)
}

/// Atomically claim a runnable task for `owner`, setting status to
/// `claimed` and stamping a new lease. Optimistic locking: the UPDATE only
/// applies if the row is still in `from` status, so concurrent claimers
/// racing on the same task see zero rows affected for all but the winner.
pub async fn claim_task(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    owner: &str,
    lease_expiry: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'claimed', lease_owner = $1, lease_expiry = $2, updated_at = NOW() \
         WHERE id = $3 AND status = $4",
    )
    .bind(owner)
    .bind(lease_expiry)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Renew a lease held by `owner`, without changing status. Fails (0 rows)
/// if the lease owner no longer matches, e.g. because the lease already
/// expired and was reclaimed by another worker.
pub async fn renew_lease(
    pool: &PgPool,
    task_id: Uuid,
    owner: &str,
    lease_expiry: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET lease_expiry = $1, updated_at = NOW() \
         WHERE id = $2 AND lease_owner = $3 \
           AND status IN ('claimed', 'running')",
    )
    .bind(lease_expiry)
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to renew lease")?;

    Ok(result.rows_affected())
}

/// Mark a claimed task as actively running.
pub async fn start_task(pool: &PgPool, task_id: Uuid, owner: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', updated_at = NOW() \
         WHERE id = $1 AND lease_owner = $2 AND status = 'claimed'",
    )
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to start task")?;

    Ok(result.rows_affected())
}

/// Record a successful completion: status becomes `succeeded`, the lease
/// is released, and `output` is stored.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    owner: &str,
    output: serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'succeeded', output = $1, \
             lease_owner = NULL, lease_expiry = NULL, updated_at = NOW() \
         WHERE id = $2 AND lease_owner = $3 AND status = 'running'",
    )
    .bind(output)
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Record a failed attempt that still has retries remaining: status
/// becomes `waiting_retry`, the attempt counter increments, and
/// `next_run_at` is set to the computed backoff deadline.
pub async fn fail_task_for_retry(
    pool: &PgPool,
    task_id: Uuid,
    owner: &str,
    error: serde_json::Value,
    next_run_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'waiting_retry', error = $1, attempt = attempt + 1, \
             next_run_at = $2, \
             lease_owner = NULL, lease_expiry = NULL, updated_at = NOW() \
         WHERE id = $3 AND lease_owner = $4 AND status = 'running'",
    )
    .bind(error)
    .bind(next_run_at)
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to record retry failure")?;

    Ok(result.rows_affected())
}

/// Record a terminal failure: attempts exhausted, status becomes `failed`.
pub async fn fail_task_terminal(
    pool: &PgPool,
    task_id: Uuid,
    owner: &str,
    error: serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error = $1, attempt = attempt + 1, \
             lease_owner = NULL, lease_expiry = NULL, updated_at = NOW() \
         WHERE id = $2 AND lease_owner = $3 AND status = 'running'",
    )
    .bind(error)
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to record terminal failure")?;

    Ok(result.rows_affected())
}

/// Append one composite step result and advance `current_step`.
pub async fn record_step_result(
    pool: &PgPool,
    task_id: Uuid,
    owner: &str,
    step_results: &[StepResult],
    current_step: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET step_results = $1, current_step = $2, updated_at = NOW() \
         WHERE id = $3 AND lease_owner = $4 AND status = 'running'",
    )
    .bind(sqlx::types::Json(step_results))
    .bind(current_step)
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to record step result")?;

    Ok(result.rows_affected())
}

/// Append a log entry to the task's bounded tail, keeping at most
/// `max_entries` most-recent entries.
///
/// Reads the current tail and writes the truncated result back inside a
/// transaction with `FOR UPDATE`, rather than expressing the truncation as
/// a single jsonb expression -- only the lease-holding worker appends to a
/// given task's log, so there is no concurrent-writer race to optimize for.
pub async fn append_log_entry(
    pool: &PgPool,
    task_id: Uuid,
    entry: &LogEntry,
    max_entries: i64,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let row: (sqlx::types::Json<Vec<LogEntry>>,) =
        sqlx::query_as("SELECT log_tail FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to read log tail")?;

    let mut tail = row.0.0;
    tail.push(entry.clone());
    let keep_from = tail.len().saturating_sub(max_entries.max(0) as usize);
    let tail = tail.split_off(keep_from);

    sqlx::query("UPDATE tasks SET log_tail = $1 WHERE id = $2")
        .bind(sqlx::types::Json(&tail))
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to write log tail")?;

    tx.commit().await.context("failed to commit log append")?;
    Ok(())
}

/// Record an operator- or handler-requested pending transition
/// (cancel/pause/resume, or a handler's own state-change request). The
/// engine applies this at the next observation point (claim, heartbeat,
/// or end of execution) rather than acting on it immediately.
pub async fn set_pending_request(
    pool: &PgPool,
    task_id: Uuid,
    request: &PendingRequest,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET pending_request = $1, updated_at = NOW() \
         WHERE id = $2 AND status NOT IN ('succeeded', 'failed', 'canceled')",
    )
    .bind(sqlx::types::Json(request))
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set pending request")?;

    Ok(result.rows_affected())
}

/// Clear a task's pending request after it has been applied.
pub async fn clear_pending_request(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE tasks SET pending_request = NULL, updated_at = NOW() WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to clear pending request")?;

    Ok(())
}

/// Apply a cancellation directly: used both for the pending-request path
/// (task was running/claimed) and the direct path (task was still queued).
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'canceled', lease_owner = NULL, lease_expiry = NULL, \
             pending_request = NULL, updated_at = NOW() \
         WHERE id = $1 AND status NOT IN ('succeeded', 'failed', 'canceled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected())
}

/// Pause a task that is not currently leased (queued states only). A
/// task that is claimed or running is paused via `set_pending_request`
/// instead, since the engine must not mutate a row a worker currently owns.
pub async fn pause_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'paused', updated_at = NOW() \
         WHERE id = $1 AND status IN ('created', 'scheduled', 'waiting_retry')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to pause task")?;

    Ok(result.rows_affected())
}

/// Resume a paused task back to `scheduled`, optionally re-timing it.
pub async fn resume_task(
    pool: &PgPool,
    task_id: Uuid,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'scheduled', next_run_at = COALESCE($1, next_run_at), updated_at = NOW() \
         WHERE id = $2 AND status = 'paused'",
    )
    .bind(next_run_at)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to resume task")?;

    Ok(result.rows_affected())
}

/// Apply a pending request recorded by `set_pending_request` at the
/// lease-holder's next observation point (heartbeat or end of execution).
/// Clears the lease and the pending request regardless of target status,
/// since a state-change request always supersedes whatever the lease
/// holder was about to persist.
pub async fn apply_pending_transition(
    pool: &PgPool,
    task_id: Uuid,
    owner: &str,
    status: TaskStatus,
    scheduled_to: Option<DateTime<Utc>>,
    error: Option<serde_json::Value>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, lease_owner = NULL, lease_expiry = NULL, \
             pending_request = NULL, error = COALESCE($2, error), \
             next_run_at = COALESCE($3, next_run_at), updated_at = NOW() \
         WHERE id = $4 AND lease_owner = $5 AND status IN ('claimed', 'running')",
    )
    .bind(status)
    .bind(error)
    .bind(scheduled_to)
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to apply pending transition")?;

    Ok(result.rows_affected())
}

/// Reclaim a task whose lease has expired: release ownership and return it
/// to `scheduled` so the next scan pass can re-dispatch it. Optimistic
/// locking on `lease_owner` protects against a race with the original
/// owner's heartbeat landing at the same moment.
pub async fn reclaim_expired_lease(pool: &PgPool, task_id: Uuid, owner: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'scheduled', lease_owner = NULL, lease_expiry = NULL, updated_at = NOW() \
         WHERE id = $1 AND lease_owner = $2 \
           AND status IN ('claimed', 'running') \
           AND lease_expiry < NOW()",
    )
    .bind(task_id)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to reclaim expired lease")?;

    Ok(result.rows_affected())
}

/// Counts of tasks by status, for monitoring and tests.
#[derive(Debug, Clone, Default)]
pub struct TaskCounts {
    pub created: i64,
    pub scheduled: i64,
    pub claimed: i64,
    pub running: i64,
    pub waiting_retry: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub canceled: i64,
    pub paused: i64,
    pub total: i64,
}

/// List the most recently created tasks, newest first. Used by the CLI's
/// `status` command when no specific task ID is given.
pub async fn list_recent_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent tasks")?;

    Ok(tasks)
}

/// Summarize task counts by status.
pub async fn get_task_counts(pool: &PgPool) -> Result<TaskCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to get task counts")?;

    let mut counts = TaskCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "created" => counts.created = *count,
            "scheduled" => counts.scheduled = *count,
            "claimed" => counts.claimed = *count,
            "running" => counts.running = *count,
            "waiting_retry" => counts.waiting_retry = *count,
            "succeeded" => counts.succeeded = *count,
            "failed" => counts.failed = *count,
            "canceled" => counts.canceled = *count,
            "paused" => counts.paused = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
