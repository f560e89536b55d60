//! `TaskEngine`: the scan loop, claim protocol, and per-task state
//! machine driver.
//!
//! Grounded on `orchestrator::run_orchestrator`'s shape -- a `Semaphore`
//! bounding concurrency, cooperative shutdown via a cancellation token,
//! and `tokio::select!` between doing work and sleeping -- generalized
//! from a fixed DAG of agent tasks to an open-ended poll-claim-dispatch
//! loop over a task repository.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use task_engine_db::models::{
    Atomicity, LogEntry, PendingRequest, RequestedStatus, SerializedError, StepOutcome,
    StepResult, Task, TaskStatus,
};

use crate::backoff::compute_backoff;
use crate::bus::{EventBus, EventKind};
use crate::config::EngineConfig;
use crate::context::{ContextEvent, LoggingBufferConfig, TaskContext};
use crate::error::EngineError;
use crate::handler::{HandlerOutcome, HandlerRegistry, StateChangeRequest};
use crate::pool::WorkerPool;
use crate::pool::messages::{WorkerJobPayload, WorkerMessage};
use crate::repository::TaskRepository;
use crate::state::TaskStateMachine;

/// The normalized result of running one handler invocation (a simple
/// task, or one step of a composite task), regardless of whether it ran
/// inline or on the worker pool.
enum Outcome {
    Success(Value),
    Failure(Value),
    StateChange(StateChangeRequest),
}

/// The scheduler. Owns the scan loop, the optional worker pool, and the
/// repository/registry/bus it dispatches through.
pub struct TaskEngine {
    repository: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    bus: Arc<dyn EventBus>,
    config: EngineConfig,
    owner: String,
    pool: Arc<Mutex<Option<WorkerPool>>>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        registry: Arc<HandlerRegistry>,
        bus: Arc<dyn EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            bus,
            config,
            owner: format!("engine-{}", Uuid::new_v4()),
            pool: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }

        if self.config.pool_enabled() {
            let pool = WorkerPool::start(
                self.config.worker_pool.size,
                self.config.worker_concurrency,
                Arc::clone(&self.registry),
            )
            .await;
            *self.pool.lock().await = Some(pool);
        }

        let engine = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { engine.run_scan_loop().await }));
        info!(owner = %self.owner, "task engine started");
    }

    /// Cooperative shutdown: signal the scan loop, join it, then give the
    /// worker pool `gracefulShutdownMsTimeout` before rejecting whatever
    /// is still outstanding.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Some(pool) = self.pool.lock().await.take() {
            let timeout = std::time::Duration::from_millis(self.config.graceful_shutdown_ms_timeout);
            if tokio::time::timeout(timeout, pool.shutdown()).await.is_err() {
                warn!("worker pool did not shut down within the graceful timeout");
            }
        }
        info!(owner = %self.owner, "task engine stopped");
    }

    /// Persist a new task and emit its CREATED status.
    pub async fn submit(
        &self,
        classification: &str,
        atomicity: Atomicity,
        input: Value,
        max_attempts: i32,
        backoff: &task_engine_db::models::BackoffPolicy,
        steps: Option<&[task_engine_db::models::StepDescriptor]>,
    ) -> Result<Task, EngineError> {
        let task = self
            .repository
            .create_task(classification, atomicity, input, max_attempts, backoff, steps)
            .await?;
        self.emit_status(task.id, TaskStatus::Created).await;
        Ok(task)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        self.request_status_change(id, RequestedStatus::Canceled, None, None).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        self.request_status_change(id, RequestedStatus::Paused, None, None).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        self.request_status_change(id, RequestedStatus::Scheduled, None, None).await
    }

    /// Cancel/pause/resume share one mechanism: leased tasks (claimed or
    /// running) get the request recorded on `pending_request` for the
    /// owning worker to apply at its next observation point; unleased
    /// tasks are transitioned directly. Terminal tasks are left alone
    /// (idempotent no-op), matching "cancel on a terminal task has no
    /// effect".
    async fn request_status_change(
        &self,
        id: Uuid,
        status: RequestedStatus,
        scheduled_to: Option<DateTime<Utc>>,
        error: Option<Value>,
    ) -> Result<(), EngineError> {
        let Some(task) = self.repository.get_task(id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        if TaskStatus::LEASED.contains(&task.status) {
            let request = PendingRequest { status, scheduled_to, error };
            self.repository.set_pending_request(id, &request).await?;
        } else {
            let target = match status {
                RequestedStatus::Canceled => TaskStatus::Canceled,
                RequestedStatus::Paused => TaskStatus::Paused,
                RequestedStatus::Scheduled => TaskStatus::Scheduled,
            };
            self.validate_transition(id, task.status, target)?;

            match status {
                RequestedStatus::Canceled => {
                    self.repository.cancel_task(id).await?;
                }
                RequestedStatus::Paused => {
                    self.repository.pause_task(id).await?;
                }
                RequestedStatus::Scheduled => {
                    self.repository.resume_task(id, scheduled_to).await?;
                }
            }
        }
        Ok(())
    }

    /// Consult `TaskStateMachine` before issuing a CAS update for it. The
    /// database WHERE clause is the actual enforcement point (it is what
    /// is safe under concurrent writers); this is a fail-fast check so a
    /// caller gets a descriptive `InvalidTransition` instead of a CAS that
    /// silently affects zero rows.
    fn validate_transition(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<(), EngineError> {
        if TaskStateMachine::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition { task_id, from, to })
        }
    }

    async fn emit_status(&self, task_id: Uuid, status: TaskStatus) {
        self.bus
            .emit(
                EventKind::Status,
                serde_json::json!({"task_id": task_id, "status": status.to_string()}),
            )
            .await;
    }

    async fn run_scan_loop(self: Arc<Self>) {
        let concurrency = self.config.effective_concurrency().max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.recover_expired_leases().await;
            let dispatched_any = self.dispatch_runnable(&semaphore).await;

            let poll_ms = if dispatched_any {
                self.config.poll_ms_busy
            } else {
                self.config.poll_ms_idle
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {}
            }
        }
    }

    /// Lease-expiry recovery: any task whose lease has elapsed returns to
    /// SCHEDULED with `attempt` unchanged, regardless of whether it was
    /// CLAIMED (never started) or RUNNING (a dead or unreachable worker).
    async fn recover_expired_leases(&self) {
        let expired = match self.repository.list_expired_leases(100).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, "failed to list expired leases");
                return;
            }
        };
        for task in expired {
            let Some(owner) = task.lease_owner.as_deref() else { continue };
            match self.repository.reclaim_expired_lease(task.id, owner).await {
                Ok(0) => {}
                Ok(_) => {
                    debug!(task_id = %task.id, "reclaimed expired lease");
                    self.emit_status(task.id, TaskStatus::Scheduled).await;
                }
                Err(err) => warn!(task_id = %task.id, %err, "failed to reclaim expired lease"),
            }
        }
    }

    /// Claim and dispatch as many runnable tasks as there is concurrency
    /// for. Returns whether anything was dispatched, which governs the
    /// next poll interval.
    async fn dispatch_runnable(self: &Arc<Self>, semaphore: &Arc<Semaphore>) -> bool {
        let available = semaphore.available_permits();
        if available == 0 {
            return false;
        }

        let runnable = match self.repository.list_runnable_tasks(available as i64).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, "failed to list runnable tasks");
                return false;
            }
        };

        let mut dispatched_any = false;
        for task in runnable {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };

            if let Err(err) = self.validate_transition(task.id, task.status, TaskStatus::Claimed) {
                warn!(task_id = %task.id, %err, "skipping task with no legal path to claimed");
                continue;
            }

            let lease_expiry = Utc::now() + ChronoDuration::milliseconds(self.config.lease_ms);
            let claimed = self
                .repository
                .claim_task(task.id, task.status, &self.owner, lease_expiry)
                .await;
            match claimed {
                Ok(0) => continue, // another worker won the race; not a dispatch
                Ok(_) => {}
                Err(err) => {
                    warn!(task_id = %task.id, %err, "claim failed");
                    continue;
                }
            }

            dispatched_any = true;
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.execute_claimed(task).await;
                drop(permit);
            });
        }

        dispatched_any
    }

    /// Drive one claimed task through RUNNING to a terminal or
    /// re-schedulable state. The only place that writes terminal or
    /// retry states, matching the single-writer invariant.
    async fn execute_claimed(&self, task: Task) {
        let task_id = task.id;

        if let Err(err) = self.validate_transition(task_id, TaskStatus::Claimed, TaskStatus::Running) {
            warn!(task_id = %task_id, %err, "refusing to start a task that was not claimed");
            return;
        }

        match self.repository.start_task(task_id, &self.owner).await {
            Ok(0) => {
                // Lease lost between claim and start; another recovery
                // pass already reclaimed it. Nothing to execute.
                return;
            }
            Err(err) => {
                warn!(task_id = %task_id, %err, "failed to transition to running");
                return;
            }
            Ok(_) => {}
        }
        self.emit_status(task_id, TaskStatus::Running).await;

        let outcome = if task.atomicity == Atomicity::Composite {
            self.run_composite(&task).await
        } else {
            self.run_invocation(&task.classification, task.input.clone(), &task, task.attempt)
                .await
        };

        self.apply_outcome(&task, outcome).await;
    }

    /// Iterate steps from `current_step`, invoking each step's handler
    /// (its own classification, defaulting to the parent's) and
    /// persisting `step_results` as they complete. Stops at the first
    /// failure or state change, exactly as a simple task would.
    async fn run_composite(&self, task: &Task) -> Outcome {
        let Some(steps) = &task.steps else {
            return Outcome::Failure(
                serde_json::to_value(SerializedError::new(
                    "CompositeError",
                    "composite task has no steps",
                ))
                .unwrap_or(Value::Null),
            );
        };

        let mut step_results = task.step_results.clone();
        let mut current_step = task.current_step;

        for (index, step) in steps.iter().enumerate().skip(task.current_step as usize) {
            let classification = step.classification.as_deref().unwrap_or(task.classification.as_str());
            let started_at = Utc::now();
            let outcome = self
                .run_invocation(classification, step.input.clone(), task, task.attempt)
                .await;

            let (status, output, error) = match &outcome {
                Outcome::Success(value) => (StepOutcome::Succeeded, Some(value.clone()), None),
                Outcome::Failure(error) => (StepOutcome::Failed, None, Some(error.clone())),
                Outcome::StateChange(_) => {
                    // A state change bypasses step bookkeeping entirely;
                    // propagate without recording a step result.
                    return outcome;
                }
            };

            step_results.push(StepResult {
                status,
                output,
                error,
                started_at,
                completed_at: Utc::now(),
            });

            // Advance only on success. A failed step is recorded at its own
            // index with `current_step` left there, so a retried attempt
            // resumes at the step that failed instead of skipping past it.
            if matches!(outcome, Outcome::Success(_)) {
                current_step = (index + 1) as i32;
            }

            if let Err(err) = self
                .repository
                .record_step_result(task.id, &self.owner, &step_results, current_step)
                .await
            {
                warn!(task_id = %task.id, %err, "failed to persist step result");
            }

            if let Outcome::Failure(_) = outcome {
                return outcome;
            }
        }

        Outcome::Success(
            step_results
                .last()
                .and_then(|r| r.output.clone())
                .unwrap_or(Value::Null),
        )
    }

    /// Run one handler invocation -- a simple task or a single composite
    /// step -- either inline or via the worker pool, streaming the
    /// context's log/progress/heartbeat events back through the engine.
    async fn run_invocation(&self, classification: &str, input: Value, task: &Task, attempt: i32) -> Outcome {
        let task_id = task.id;
        let logging = LoggingBufferConfig {
            stream_buffer_size: self.config.stream_buffer_size,
            max_logging_buffer: self.config.max_logging_buffer,
            logging_buffer_truncation: self.config.logging_buffer_truncation,
        };

        let pool = self.pool.lock().await.clone();
        if let Some(pool) = pool {
            let (events_tx, events_rx) = mpsc::unbounded_channel::<WorkerMessage>();
            let pump = self.spawn_event_pump(task_id, events_rx);

            let payload = WorkerJobPayload {
                job_id: Uuid::new_v4(),
                task_id,
                classification: classification.to_string(),
                input,
                attempt,
                result_cache: None,
                stream_buffer_size: logging.stream_buffer_size,
                max_logging_buffer: logging.max_logging_buffer,
                logging_buffer_truncation: logging.logging_buffer_truncation,
            };

            let outcome = pool.submit_with_events(payload, events_tx).await;
            drop(pump);

            return match outcome {
                Ok(crate::pool::PoolJobOutcome::Success(v)) => Outcome::Success(v),
                Ok(crate::pool::PoolJobOutcome::Failure(message)) => Outcome::Failure(
                    serde_json::to_value(SerializedError::new("HandlerError", message))
                        .unwrap_or(Value::Null),
                ),
                Ok(crate::pool::PoolJobOutcome::StateChange(request)) => Outcome::StateChange(request),
                Err(err) => Outcome::Failure(
                    serde_json::to_value(SerializedError::new("PoolError", err.to_string()))
                        .unwrap_or(Value::Null),
                ),
            };
        }

        let Some(handler) = self.registry.get(classification) else {
            return Outcome::Failure(
                serde_json::to_value(SerializedError::new(
                    "UnknownClassification",
                    format!("no handler registered for '{classification}'"),
                ))
                .unwrap_or(Value::Null),
            );
        };

        let (ctx, events_rx) =
            TaskContext::with_logging_config(task_id, attempt, Arc::new(dashmap::DashMap::new()), logging);

        let engine_events = self.spawn_inline_event_pump(task_id, events_rx);

        let outcome = handler.run(input, &ctx).await;
        ctx.flush().await;
        drop(ctx);
        let _ = engine_events.await;

        match outcome {
            HandlerOutcome::Success(v) => Outcome::Success(v),
            HandlerOutcome::Error(err) => Outcome::Failure(
                serde_json::to_value(SerializedError::from_anyhow(&err)).unwrap_or(Value::Null),
            ),
            HandlerOutcome::StateChange(request) => Outcome::StateChange(request),
        }
    }

    /// Forward worker-sourced events (pool mode) to log persistence,
    /// lease renewal, and the bus.
    fn spawn_event_pump(
        &self,
        task_id: Uuid,
        mut events_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let repository = Arc::clone(&self.repository);
        let bus = Arc::clone(&self.bus);
        let owner = self.owner.clone();
        let lease_ms = self.config.lease_ms;
        let log_tail_max = self.config.log_tail_max as i64;

        tokio::spawn(async move {
            while let Some(message) = events_rx.recv().await {
                match message {
                    WorkerMessage::Log { entries, .. } => {
                        for entry in entries {
                            let log_entry = LogEntry {
                                level: wire_level_to_log_level(&entry.level),
                                message: entry.message.clone(),
                                extra: entry.extra.clone(),
                                recorded_at: entry.recorded_at,
                            };
                            if let Err(err) =
                                repository.append_log_entry(task_id, &log_entry, log_tail_max).await
                            {
                                warn!(task_id = %task_id, %err, "failed to persist log entry");
                            }
                            bus.emit(
                                EventKind::Log,
                                serde_json::json!({"task_id": task_id, "message": entry.message}),
                            )
                            .await;
                        }
                    }
                    WorkerMessage::Progress { payload, .. } => {
                        bus.emit(
                            EventKind::Progress,
                            serde_json::json!({"task_id": task_id, "payload": payload}),
                        )
                        .await;
                    }
                    WorkerMessage::Heartbeat { .. } => {
                        if !apply_pending_if_present(&repository, &bus, task_id, &owner).await {
                            let lease_expiry = Utc::now() + ChronoDuration::milliseconds(lease_ms);
                            let _ = repository.renew_lease(task_id, &owner, lease_expiry).await;
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Same as `spawn_event_pump` but for the inline path, where the
    /// source is a `ContextEvent` stream rather than wire messages.
    fn spawn_inline_event_pump(
        &self,
        task_id: Uuid,
        mut events_rx: mpsc::Receiver<ContextEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let repository = Arc::clone(&self.repository);
        let bus = Arc::clone(&self.bus);
        let owner = self.owner.clone();
        let lease_ms = self.config.lease_ms;
        let log_tail_max = self.config.log_tail_max as i64;

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ContextEvent::Log(entries) => {
                        for entry in entries {
                            let log_entry = LogEntry {
                                level: entry.level.into(),
                                message: entry.message.clone(),
                                extra: entry.extra.clone(),
                                recorded_at: entry.recorded_at,
                            };
                            if let Err(err) =
                                repository.append_log_entry(task_id, &log_entry, log_tail_max).await
                            {
                                warn!(task_id = %task_id, %err, "failed to persist log entry");
                            }
                            bus.emit(
                                EventKind::Log,
                                serde_json::json!({"task_id": task_id, "message": entry.message}),
                            )
                            .await;
                        }
                    }
                    ContextEvent::Progress(payload) => {
                        bus.emit(
                            EventKind::Progress,
                            serde_json::json!({"task_id": task_id, "payload": payload}),
                        )
                        .await;
                    }
                    ContextEvent::Heartbeat => {
                        if !apply_pending_if_present(&repository, &bus, task_id, &owner).await {
                            let lease_expiry = Utc::now() + ChronoDuration::milliseconds(lease_ms);
                            let _ = repository.renew_lease(task_id, &owner, lease_expiry).await;
                        }
                    }
                }
            }
        })
    }

    /// Apply the outcome of a handler invocation: success, retryable or
    /// terminal failure, or a requested state change. The only method
    /// that writes a terminal or retry state.
    async fn apply_outcome(&self, task: &Task, outcome: Outcome) {
        let task_id = task.id;

        // A cancel/pause/resume request recorded while this task was
        // running supersedes whatever the handler just returned -- this
        // is the "end of execution" observation point from the pending
        // request's three (claim, heartbeat, end-of-execution) chances
        // to be applied.
        if apply_pending_if_present(&self.repository, &self.bus, task_id, &self.owner).await {
            return;
        }

        match outcome {
            Outcome::Success(output) => {
                if let Err(err) = self.validate_transition(task_id, TaskStatus::Running, TaskStatus::Succeeded) {
                    warn!(task_id = %task_id, %err, "refusing to record success");
                    return;
                }
                if let Err(err) = self.repository.complete_task(task_id, &self.owner, output).await {
                    warn!(task_id = %task_id, %err, "failed to record success");
                    return;
                }
                self.emit_status(task_id, TaskStatus::Succeeded).await;
            }
            Outcome::Failure(error) => {
                let next_attempt = task.attempt + 1;
                if next_attempt < task.max_attempts {
                    if let Err(err) = self.validate_transition(task_id, TaskStatus::Running, TaskStatus::WaitingRetry) {
                        warn!(task_id = %task_id, %err, "refusing to record retry");
                        return;
                    }
                    let delay_ms = compute_backoff(next_attempt as u32, &task.backoff);
                    let next_run_at = Utc::now() + ChronoDuration::milliseconds(delay_ms);
                    if let Err(err) = self
                        .repository
                        .fail_task_for_retry(task_id, &self.owner, error, next_run_at)
                        .await
                    {
                        warn!(task_id = %task_id, %err, "failed to record retry");
                        return;
                    }
                    self.emit_status(task_id, TaskStatus::WaitingRetry).await;
                } else {
                    if let Err(err) = self.validate_transition(task_id, TaskStatus::Running, TaskStatus::Failed) {
                        warn!(task_id = %task_id, %err, "refusing to record terminal failure");
                        return;
                    }
                    if let Err(err) = self
                        .repository
                        .fail_task_terminal(task_id, &self.owner, error)
                        .await
                    {
                        warn!(task_id = %task_id, %err, "failed to record terminal failure");
                        return;
                    }
                    self.emit_status(task_id, TaskStatus::Failed).await;
                }
            }
            Outcome::StateChange(request) => {
                self.apply_state_change(task_id, request).await;
            }
        }
    }

    /// A handler-thrown `StateChange` bypasses retry accounting entirely
    /// and is applied verbatim, clearing the lease regardless of target
    /// status.
    async fn apply_state_change(&self, task_id: Uuid, request: StateChangeRequest) {
        let target = match request.status {
            crate::handler::RequestedStatus::Canceled => TaskStatus::Canceled,
            crate::handler::RequestedStatus::Paused => TaskStatus::Paused,
            crate::handler::RequestedStatus::Scheduled => TaskStatus::Scheduled,
        };
        if let Err(err) = self.validate_transition(task_id, TaskStatus::Running, target) {
            warn!(task_id = %task_id, %err, "refusing handler-requested state change");
            return;
        }

        // A handler throws this while holding the lease (it is running
        // synchronously inside the claimed task's execution), so every
        // branch has to clear that lease as part of the transition --
        // `pause_task`/`resume_task` assume an unleased task and would
        // silently no-op here. `apply_pending_transition` is the one
        // query gated on `status IN ('claimed', 'running')`.
        let result = match request.status {
            crate::handler::RequestedStatus::Canceled => {
                self.repository.cancel_task(task_id).await.map(|_| TaskStatus::Canceled)
            }
            crate::handler::RequestedStatus::Paused => {
                self.repository
                    .apply_pending_transition(task_id, &self.owner, TaskStatus::Paused, None, request.error.clone())
                    .await
                    .map(|_| TaskStatus::Paused)
            }
            crate::handler::RequestedStatus::Scheduled => {
                self.repository
                    .apply_pending_transition(
                        task_id,
                        &self.owner,
                        TaskStatus::Scheduled,
                        request.scheduled_to,
                        request.error.clone(),
                    )
                    .await
                    .map(|_| TaskStatus::Scheduled)
            }
        };

        match result {
            Ok(status) => self.emit_status(task_id, status).await,
            Err(err) => warn!(task_id = %task_id, %err, "failed to apply state change"),
        }
    }
}

/// Check whether a pending cancel/pause/resume request has been recorded
/// against `task_id` and, if so, apply it in place of whatever the
/// caller was about to persist. This is the shared mechanism behind
/// "cancellation transitions to CANCELED on the next lease-holder
/// heartbeat or claim": a request recorded mid-execution is invisible to
/// the running handler, but the first persistent update afterwards (a
/// heartbeat, or the final outcome write) observes and applies it
/// instead of the handler's own result.
///
/// Returns `true` if a pending request was applied, meaning the lease is
/// now released and the caller must not attempt its own persistence.
async fn apply_pending_if_present(
    repository: &Arc<dyn TaskRepository>,
    bus: &Arc<dyn EventBus>,
    task_id: Uuid,
    owner: &str,
) -> bool {
    let Ok(Some(current)) = repository.get_task(task_id).await else {
        return false;
    };
    let Some(pending) = current.pending_request else {
        return false;
    };

    let status = match pending.status {
        RequestedStatus::Canceled => TaskStatus::Canceled,
        RequestedStatus::Paused => TaskStatus::Paused,
        RequestedStatus::Scheduled => TaskStatus::Scheduled,
    };

    match repository
        .apply_pending_transition(task_id, owner, status, pending.scheduled_to, pending.error)
        .await
    {
        Ok(0) => false,
        Ok(_) => {
            bus.emit(
                EventKind::Status,
                serde_json::json!({"task_id": task_id, "status": status.to_string()}),
            )
            .await;
            true
        }
        Err(_) => false,
    }
}

fn wire_level_to_log_level(level: &str) -> task_engine_db::models::LogLevel {
    match level {
        "trace" => task_engine_db::models::LogLevel::Trace,
        "debug" => task_engine_db::models::LogLevel::Debug,
        "warn" => task_engine_db::models::LogLevel::Warn,
        "error" => task_engine_db::models::LogLevel::Error,
        _ => task_engine_db::models::LogLevel::Info,
    }
}
