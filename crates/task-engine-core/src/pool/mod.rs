//! The host-side worker pool: spawns and supervises worker threads,
//! routes jobs respecting per-worker capacity, forwards streamed events
//! back to the engine, and resurrects crashed workers.
//!
//! Grounded on the teacher's `orchestrator::run_orchestrator` (semaphore
//! admission, `mpsc` result channel, per-job `tokio::spawn`), generalized
//! from a fixed DAG of agent tasks to an open-ended FIFO job queue, and on
//! `ClaudeCodeAdapter`'s per-process bookkeeping for the worker registry.

pub mod messages;
pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::error::EngineError;
use crate::handler::{HandlerRegistry, StateChangeRequest};
use messages::{ControlCommand, HostMessage, WorkerJobPayload, WorkerMessage};

/// Outcome of a job dispatched to the pool. `Err` is reserved for
/// pool-level failures (shutdown, a crash with no salvageable result); an
/// ordinary handler failure surfaces as `Failure`, mirroring `HandlerOutcome`.
#[derive(Debug, Clone)]
pub enum PoolJobOutcome {
    Success(Value),
    Failure(String),
    StateChange(StateChangeRequest),
}

/// A job submitted to the pool, awaiting a worker slot.
struct QueuedJob {
    payload: WorkerJobPayload,
    resolver: oneshot::Sender<Result<PoolJobOutcome, EngineError>>,
}

/// Bookkeeping for one live worker thread.
struct WorkerHandle {
    id: Uuid,
    to_worker: std_mpsc::Sender<HostMessage>,
    join: std::thread::JoinHandle<()>,
    active_jobs: usize,
    ready: bool,
}

/// An in-flight job: which worker it is bound to, its original payload
/// (kept so a crash can re-enqueue it verbatim), and the resolver that
/// completes the caller's `submit` future.
struct InFlightJob {
    worker_id: Uuid,
    payload: WorkerJobPayload,
    resolver: oneshot::Sender<Result<PoolJobOutcome, EngineError>>,
}

struct PoolState {
    workers: HashMap<Uuid, WorkerHandle>,
    queue: VecDeque<QueuedJob>,
    in_flight: HashMap<Uuid, InFlightJob>,
    capacity_per_worker: usize,
    shutting_down: bool,
}

/// Host side of the worker pool. Cheap to clone; all mutable state lives
/// behind an internal mutex plus a from-worker event receiver task.
#[derive(Clone)]
pub struct WorkerPool {
    state: Arc<Mutex<PoolState>>,
    registry: Arc<HandlerRegistry>,
    result_cache: Arc<DashMap<Uuid, HashMap<String, Value>>>,
    from_workers_tx: std_mpsc::Sender<WorkerMessage>,
    /// Per-job sinks for `Log`/`Progress`/`Heartbeat`, registered by
    /// `submit_with_events`. The pool itself only routes these; the
    /// caller that owns the originating `TaskContext` semantics (the
    /// engine) decides what to do with them (persist a log tail, renew a
    /// lease, emit on the bus).
    event_sinks: Arc<DashMap<Uuid, mpsc::UnboundedSender<WorkerMessage>>>,
}

impl WorkerPool {
    /// Spawn `size` workers up front and start routing.
    pub async fn start(size: usize, capacity_per_worker: usize, registry: Arc<HandlerRegistry>) -> Self {
        let (from_workers_tx, from_workers_rx) = std_mpsc::channel();

        let pool = Self {
            state: Arc::new(Mutex::new(PoolState {
                workers: HashMap::new(),
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
                capacity_per_worker,
                shutting_down: false,
            })),
            registry,
            result_cache: Arc::new(DashMap::new()),
            from_workers_tx,
            event_sinks: Arc::new(DashMap::new()),
        };

        for _ in 0..size {
            pool.spawn_one_worker().await;
        }

        pool.clone().spawn_event_pump(from_workers_rx);
        pool
    }

    fn spawn_event_pump(self, from_workers_rx: std_mpsc::Receiver<WorkerMessage>) {
        // The channel is std::sync::mpsc (workers are plain OS threads);
        // bridge it onto a blocking task so async code can await results.
        tokio::task::spawn_blocking(move || {
            while let Ok(message) = from_workers_rx.recv() {
                let pool = self.clone();
                tokio::runtime::Handle::current().block_on(pool.handle_worker_message(message));
            }
        });
    }

    async fn spawn_one_worker(&self) {
        let worker_id = Uuid::new_v4();
        let (to_worker_tx, to_worker_rx) = std_mpsc::channel();
        let join = worker::spawn_worker(
            worker_id,
            Arc::clone(&self.registry),
            to_worker_rx,
            self.from_workers_tx.clone(),
        );

        let mut state = self.state.lock().await;
        state.workers.insert(
            worker_id,
            WorkerHandle {
                id: worker_id,
                to_worker: to_worker_tx,
                join,
                active_jobs: 0,
                ready: false,
            },
        );
    }

    /// Submit a job, returning a future resolved when the worker reports a
    /// result or the job is rejected (shutdown, worker crash exhausting
    /// retries is not modeled here -- a crashed job is simply re-queued).
    pub async fn submit(
        &self,
        payload: WorkerJobPayload,
    ) -> Result<PoolJobOutcome, EngineError> {
        let (_tx, _rx) = mpsc::unbounded_channel();
        self.submit_with_events(payload, _tx).await
    }

    /// Submit a job, additionally forwarding every `Log`/`Progress`/
    /// `Heartbeat` message the assigned worker emits for it to `events`.
    /// The caller owns interpreting those (persisting a log tail,
    /// renewing a lease, publishing to an event bus); the pool itself
    /// only plumbs them through.
    pub async fn submit_with_events(
        &self,
        mut payload: WorkerJobPayload,
        events: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Result<PoolJobOutcome, EngineError> {
        if let Some(cached) = self.result_cache.get(&payload.task_id) {
            payload.result_cache = Some(cached.clone());
        }

        let job_id = payload.job_id;
        self.event_sinks.insert(job_id, events);

        let (resolver, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                self.event_sinks.remove(&job_id);
                return Err(EngineError::ShutdownRejected(payload.job_id));
            }
            state.queue.push_back(QueuedJob { payload, resolver });
        }
        self.drain_queue().await;

        let outcome = receiver
            .await
            .unwrap_or(Err(EngineError::WorkerTerminated {
                worker_id: Uuid::nil(),
                job_id: Uuid::nil(),
            }));
        self.event_sinks.remove(&job_id);
        outcome
    }

    /// Assign as many queued jobs as there is worker capacity for, sorted
    /// by ascending `active_jobs` so load spreads evenly.
    async fn drain_queue(&self) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }

        loop {
            let Some(worker_id) = state
                .workers
                .values()
                .filter(|w| w.ready && w.active_jobs < state.capacity_per_worker)
                .min_by_key(|w| w.active_jobs)
                .map(|w| w.id)
            else {
                break;
            };

            let Some(job) = state.queue.pop_front() else {
                break;
            };

            let job_id = job.payload.job_id;
            let worker = state.workers.get_mut(&worker_id).expect("worker just selected");
            worker.active_jobs += 1;
            let _ = worker
                .to_worker
                .send(HostMessage::Execute { job: job.payload.clone() });
            state.in_flight.insert(
                job_id,
                InFlightJob {
                    worker_id,
                    payload: job.payload,
                    resolver: job.resolver,
                },
            );
        }
    }

    async fn handle_worker_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready { worker_id } => {
                {
                    let mut state = self.state.lock().await;
                    if let Some(worker) = state.workers.get_mut(&worker_id) {
                        worker.ready = true;
                    }
                }
                self.drain_queue().await;
            }
            WorkerMessage::Log { job_id, .. }
            | WorkerMessage::Progress { job_id, .. }
            | WorkerMessage::Heartbeat { job_id } => {
                if let Some(sink) = self.event_sinks.get(&job_id) {
                    let _ = sink.send(message);
                }
            }
            WorkerMessage::Result {
                job_id,
                output,
                result_cache,
            } => {
                if let Some(cache) = result_cache {
                    self.merge_result_cache(job_id, cache).await;
                }
                self.resolve_job(job_id, Ok(PoolJobOutcome::Success(output))).await;
            }
            WorkerMessage::Error {
                job_id,
                message,
                state_change,
            } => {
                let outcome = match state_change {
                    Some(request) => PoolJobOutcome::StateChange(request),
                    None => PoolJobOutcome::Failure(
                        message.unwrap_or_else(|| "handler failed with no message".to_string()),
                    ),
                };
                self.resolve_job(job_id, Ok(outcome)).await;
            }
            WorkerMessage::Exited { worker_id, reason } => {
                self.handle_worker_exit(worker_id, &reason).await;
            }
        }
    }

    /// The merge key is the job's task id, kept alongside its payload so a
    /// retried attempt of the same task picks up the cache on its next
    /// `submit` call (see the lookup at the top of `submit`).
    async fn merge_result_cache(&self, job_id: Uuid, cache: HashMap<String, Value>) {
        let task_id = {
            let state = self.state.lock().await;
            state.in_flight.get(&job_id).map(|job| job.payload.task_id)
        };
        if let Some(task_id) = task_id {
            self.result_cache.entry(task_id).or_default().extend(cache);
        }
    }

    async fn resolve_job(&self, job_id: Uuid, result: Result<PoolJobOutcome, EngineError>) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.in_flight.remove(&job_id) {
            if let Some(worker) = state.workers.get_mut(&job.worker_id) {
                worker.active_jobs = worker.active_jobs.saturating_sub(1);
            }
            let _ = job.resolver.send(result);
        }
        drop(state);
        self.drain_queue().await;
    }

    /// Remove the crashed worker, re-enqueue its in-flight jobs verbatim
    /// at the head of the queue, and spawn a replacement if the pool is
    /// not shutting down.
    async fn handle_worker_exit(&self, worker_id: Uuid, reason: &str) {
        let orphaned_count;
        let should_replace;
        {
            let mut state = self.state.lock().await;
            state.workers.remove(&worker_id);

            let orphaned_ids: Vec<Uuid> = state
                .in_flight
                .iter()
                .filter(|(_, job)| job.worker_id == worker_id)
                .map(|(job_id, _)| *job_id)
                .collect();
            let mut orphaned: Vec<InFlightJob> = orphaned_ids
                .into_iter()
                .filter_map(|job_id| state.in_flight.remove(&job_id))
                .collect();
            orphaned_count = orphaned.len();

            // Push in reverse so the set of orphaned jobs ends up at the
            // head in their original relative order.
            for job in orphaned.drain(..).rev() {
                state.queue.push_front(QueuedJob {
                    payload: job.payload,
                    resolver: job.resolver,
                });
            }
            should_replace = !state.shutting_down;
        }

        tracing::warn!(worker = %worker_id, reason, jobs = orphaned_count, "worker exited, requeueing in-flight jobs");

        if should_replace {
            self.spawn_one_worker().await;
        }
        self.drain_queue().await;
    }

    /// Send `control:shutdown` to every worker, reject queued and
    /// in-flight jobs, and stop accepting new submissions.
    pub async fn shutdown(&self) {
        let (queued, in_flight, workers): (Vec<QueuedJob>, Vec<InFlightJob>, Vec<Uuid>) = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            let queued = std::mem::take(&mut state.queue).into_iter().collect();
            let in_flight = state.in_flight.drain().map(|(_, job)| job).collect();
            let workers: Vec<Uuid> = state.workers.keys().copied().collect();
            (queued, in_flight, workers)
        };

        for job in queued {
            let _ = job.resolver.send(Err(EngineError::ShutdownRejected(job.payload.job_id)));
        }
        for job in in_flight {
            let _ = job.resolver.send(Err(EngineError::WorkerTerminated {
                worker_id: job.worker_id,
                job_id: job.payload.job_id,
            }));
        }

        let mut state = self.state.lock().await;
        for worker_id in workers {
            if let Some(worker) = state.workers.get(&worker_id) {
                let _ = worker.to_worker.send(HostMessage::Control {
                    command: ControlCommand::Shutdown,
                });
            }
        }
        let joins: Vec<std::thread::JoinHandle<()>> =
            state.workers.drain().map(|(_, w)| w.join).collect();
        drop(state);
        let _ = tokio::task::spawn_blocking(move || {
            for join in joins {
                let _ = join.join();
            }
        })
        .await;
    }

    #[cfg(test)]
    pub(crate) async fn worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::handler::{Handler, HandlerOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn run(&self, input: Value, _ctx: &TaskContext) -> HandlerOutcome {
            HandlerOutcome::Success(input)
        }
    }

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn run(&self, _input: Value, _ctx: &TaskContext) -> HandlerOutcome {
            panic!("boom");
        }
    }

    struct CountingThenSucceeds(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingThenSucceeds {
        async fn run(&self, _input: Value, _ctx: &TaskContext) -> HandlerOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            // Never returns: stands in for "the process died mid-job".
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn payload(classification: &str) -> WorkerJobPayload {
        WorkerJobPayload {
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            classification: classification.to_string(),
            input: serde_json::json!({}),
            attempt: 1,
            result_cache: None,
            stream_buffer_size: 20,
            max_logging_buffer: 1_000,
            logging_buffer_truncation: 100,
        }
    }

    fn registry_with(classification: &str, handler: impl Handler + 'static) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(classification, handler);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn submit_runs_job_and_returns_success() {
        let pool = WorkerPool::start(1, 4, registry_with("echo", Echo)).await;
        let outcome = pool.submit(payload("echo")).await.unwrap();
        match outcome {
            PoolJobOutcome::Success(v) => assert_eq!(v, serde_json::json!({})),
            _ => panic!("expected success"),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn jobs_queue_past_capacity_and_still_complete() {
        let pool = WorkerPool::start(1, 1, registry_with("echo", Echo)).await;
        let jobs: Vec<_> = (0..5).map(|_| pool.submit(payload("echo"))).collect();
        let results = futures::future::join_all(jobs).await;
        assert!(results.into_iter().all(|r| matches!(r, Ok(PoolJobOutcome::Success(_)))));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_classification_surfaces_as_failure() {
        let pool = WorkerPool::start(1, 1, registry_with("echo", Echo)).await;
        let outcome = pool.submit(payload("missing")).await.unwrap();
        assert!(matches!(outcome, PoolJobOutcome::Failure(_)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn worker_crash_respawns_a_replacement() {
        let pool = WorkerPool::start(1, 2, registry_with("panics", Panics)).await;
        // Expect the pool to see a crash and, rather than hang forever on a
        // dead worker, still surface a result once respawned.
        let outcome = pool.submit(payload("panics")).await;
        assert!(outcome.is_err() || matches!(outcome, Ok(PoolJobOutcome::Failure(_))));
        // Give the event pump a moment to process `Exited` and respawn.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(pool.worker_count().await, 1);
        let outcome = pool.submit(payload("panics")).await;
        assert!(outcome.is_err() || matches!(outcome, Ok(PoolJobOutcome::Failure(_))));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_and_in_flight_jobs() {
        let never_finishes = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(
            1,
            1,
            registry_with("stuck", CountingThenSucceeds(Arc::clone(&never_finishes))),
        )
        .await;

        let in_flight = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(payload("stuck")).await })
        };
        // Let the job actually get picked up by the worker before queuing more.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(payload("stuck")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        pool.shutdown().await;

        assert!(matches!(
            queued.await.unwrap(),
            Err(EngineError::ShutdownRejected(_))
        ));
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(EngineError::WorkerTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::start(1, 1, registry_with("echo", Echo)).await;
        pool.shutdown().await;
        let outcome = pool.submit(payload("echo")).await;
        assert!(matches!(outcome, Err(EngineError::ShutdownRejected(_))));
    }
}
