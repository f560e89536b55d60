//! The worker thread (guest side): job intake, handler invocation, and
//! result/log streaming back to the host.
//!
//! Grounded on the teacher's `ClaudeCodeAdapter` in spirit -- a dedicated
//! OS thread owning its own small Tokio runtime, reading a command stream
//! and writing structured events back -- but here the "subprocess" is an
//! in-process thread and the wire is `std::sync::mpsc` rather than a pipe.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use futures::FutureExt;
use uuid::Uuid;

use crate::context::{ContextEvent, LoggingBufferConfig, TaskContext};
use crate::handler::{HandlerOutcome, HandlerRegistry};
use crate::pool::messages::{ControlCommand, HostMessage, LogEntryWire, WorkerJobPayload, WorkerMessage};

/// Spawn a worker thread. Returns immediately; the worker announces
/// itself with `WorkerMessage::Ready` once its runtime is up.
///
/// The worker loop owns a single-threaded Tokio runtime so handler
/// futures (which may themselves await I/O) run without competing for
/// the host's own runtime.
pub fn spawn_worker(
    worker_id: Uuid,
    registry: Arc<HandlerRegistry>,
    inbox: std_mpsc::Receiver<HostMessage>,
    outbox: std_mpsc::Sender<WorkerMessage>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("task-engine-worker-{worker_id}"))
        .spawn(move || worker_main(worker_id, registry, inbox, outbox))
        .expect("failed to spawn worker thread")
}

fn worker_main(
    worker_id: Uuid,
    registry: Arc<HandlerRegistry>,
    inbox: std_mpsc::Receiver<HostMessage>,
    outbox: std_mpsc::Sender<WorkerMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            let _ = outbox.send(WorkerMessage::Exited {
                worker_id,
                reason: format!("failed to start worker runtime: {err}"),
            });
            return;
        }
    };

    let _ = outbox.send(WorkerMessage::Ready { worker_id });

    runtime.block_on(async move {
        while let Ok(message) = inbox.recv() {
            match message {
                HostMessage::Control {
                    command: ControlCommand::Stop | ControlCommand::Shutdown,
                } => break,
                HostMessage::Execute { job } => {
                    // A handler panic must not silently wedge the pool: catch
                    // it at the job boundary, report `Exited`, and let this
                    // thread end so the pool can requeue and replace it.
                    let outcome = AssertUnwindSafe(run_job(&registry, job, &outbox))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = outcome {
                        let _ = outbox.send(WorkerMessage::Exited {
                            worker_id,
                            reason: panic_message(&panic),
                        });
                        return;
                    }
                }
            }
        }
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

async fn run_job(
    registry: &HandlerRegistry,
    job: WorkerJobPayload,
    outbox: &std_mpsc::Sender<WorkerMessage>,
) {
    let job_id = job.job_id;

    let Some(handler) = registry.get(&job.classification) else {
        let _ = outbox.send(WorkerMessage::Error {
            job_id,
            message: Some(format!("no handler registered for '{}'", job.classification)),
            state_change: None,
        });
        return;
    };

    let cache: Arc<dashmap::DashMap<String, serde_json::Value>> = job
        .result_cache
        .map(|m| Arc::new(m.into_iter().collect()))
        .unwrap_or_default();
    let (ctx, mut events) = TaskContext::with_logging_config(
        job.task_id,
        job.attempt,
        Arc::clone(&cache),
        LoggingBufferConfig {
            stream_buffer_size: job.stream_buffer_size,
            max_logging_buffer: job.max_logging_buffer,
            logging_buffer_truncation: job.logging_buffer_truncation,
        },
    );

    let pump_outbox = outbox.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            forward_event(job_id, event, &pump_outbox);
        }
    });

    let outcome = handler.run(job.input, &ctx).await;
    ctx.flush().await;

    // Drop the context's sender side (by dropping `ctx`) so the pump task's
    // receiver loop above terminates once drained, then await it.
    drop(ctx);
    let _ = pump.await;

    let result_cache: std::collections::HashMap<String, serde_json::Value> = cache
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    let result_cache = if result_cache.is_empty() {
        None
    } else {
        Some(result_cache)
    };

    match outcome {
        HandlerOutcome::Success(output) => {
            let _ = outbox.send(WorkerMessage::Result {
                job_id,
                output,
                result_cache,
            });
        }
        HandlerOutcome::Error(err) => {
            let _ = outbox.send(WorkerMessage::Error {
                job_id,
                message: Some(err.to_string()),
                state_change: None,
            });
        }
        HandlerOutcome::StateChange(request) => {
            let _ = outbox.send(WorkerMessage::Error {
                job_id,
                message: None,
                state_change: Some(request),
            });
        }
    }
}

fn forward_event(job_id: Uuid, event: ContextEvent, outbox: &std_mpsc::Sender<WorkerMessage>) {
    match event {
        ContextEvent::Log(entries) => {
            if entries.is_empty() {
                return;
            }
            let wire: Vec<LogEntryWire> = entries.iter().map(LogEntryWire::from).collect();
            let _ = outbox.send(WorkerMessage::Log { job_id, entries: wire });
        }
        ContextEvent::Progress(payload) => {
            let _ = outbox.send(WorkerMessage::Progress { job_id, payload });
        }
        ContextEvent::Heartbeat => {
            let _ = outbox.send(WorkerMessage::Heartbeat { job_id });
        }
    }
}
