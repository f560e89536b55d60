//! End-to-end coverage of `TaskEngine` against `InMemoryTaskRepository`:
//! no database, no worker pool, just the scan loop and state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use task_engine_core::bus::BroadcastEventBus;
use task_engine_core::config::EngineConfig;
use task_engine_core::context::TaskContext;
use task_engine_core::engine::TaskEngine;
use task_engine_core::handler::{Handler, HandlerOutcome, HandlerRegistry, StateChangeRequest};
use task_engine_core::repository::InMemoryTaskRepository;
use task_engine_db::models::{Atomicity, BackoffPolicy, StepDescriptor, TaskStatus};

struct Succeeds;

#[async_trait]
impl Handler for Succeeds {
    async fn run(&self, input: Value, _ctx: &TaskContext) -> HandlerOutcome {
        HandlerOutcome::Success(input)
    }
}

struct AlwaysFails;

#[async_trait]
impl Handler for AlwaysFails {
    async fn run(&self, _input: Value, _ctx: &TaskContext) -> HandlerOutcome {
        HandlerOutcome::Error(anyhow::anyhow!("handler always fails"))
    }
}

struct FailsThenSucceeds(Arc<AtomicUsize>);

#[async_trait]
impl Handler for FailsThenSucceeds {
    async fn run(&self, input: Value, _ctx: &TaskContext) -> HandlerOutcome {
        let attempt = self.0.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            HandlerOutcome::Error(anyhow::anyhow!("transient failure"))
        } else {
            HandlerOutcome::Success(input)
        }
    }
}

struct RequestsCancel;

#[async_trait]
impl Handler for RequestsCancel {
    async fn run(&self, _input: Value, _ctx: &TaskContext) -> HandlerOutcome {
        HandlerOutcome::StateChange(StateChangeRequest {
            status: task_engine_core::handler::RequestedStatus::Canceled,
            scheduled_to: None,
            error: None,
        })
    }
}

struct RequestsPause;

#[async_trait]
impl Handler for RequestsPause {
    async fn run(&self, _input: Value, _ctx: &TaskContext) -> HandlerOutcome {
        HandlerOutcome::StateChange(StateChangeRequest {
            status: task_engine_core::handler::RequestedStatus::Paused,
            scheduled_to: None,
            error: None,
        })
    }
}

fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        poll_ms_idle: 10,
        poll_ms_busy: 5,
        lease_ms: 5_000,
        ..EngineConfig::default()
    }
}

async fn run_until<F>(repo: &InMemoryTaskRepository, task_id: uuid::Uuid, mut done: F) -> task_engine_db::models::Task
where
    F: FnMut(&task_engine_db::models::Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = repo.get_task(task_id).await.unwrap().unwrap();
        if done(&task) {
            return task;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for task {task_id}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn scenario_a_simple_task_succeeds() {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Succeeds);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));
    let mut subscriber = bus.subscribe();

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let task = engine
        .submit("echo", Atomicity::Simple, json!({"x": 1}), 3, &BackoffPolicy::default(), None)
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status.is_terminal()).await;
    assert_eq!(final_task.status, TaskStatus::Succeeded);
    assert_eq!(final_task.output, Some(json!({"x": 1})));
    assert!(final_task.lease_owner.is_none());

    engine.stop().await;

    // At least one status transition should have reached the bus.
    let mut saw_succeeded = false;
    while let Ok(event) = subscriber.try_recv() {
        if event.payload.get("status").and_then(|v| v.as_str()) == Some("succeeded") {
            saw_succeeded = true;
        }
    }
    assert!(saw_succeeded);
}

#[tokio::test]
async fn scenario_b_retries_until_max_attempts_then_fails() {
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", AlwaysFails);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let backoff = BackoffPolicy::Fixed { base_ms: 5 };
    let task = engine
        .submit("flaky", Atomicity::Simple, json!({}), 3, &backoff, None)
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status == TaskStatus::Failed).await;
    assert_eq!(final_task.attempt, 3);
    assert!(final_task.error.is_some());

    engine.stop().await;
}

#[tokio::test]
async fn scenario_b_recovers_after_one_transient_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", FailsThenSucceeds(calls.clone()));

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let backoff = BackoffPolicy::Fixed { base_ms: 5 };
    let task = engine
        .submit("flaky", Atomicity::Simple, json!({"ok": true}), 5, &backoff, None)
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status.is_terminal()).await;
    assert_eq!(final_task.status, TaskStatus::Succeeded);
    assert_eq!(final_task.attempt, 1);

    engine.stop().await;
}

#[tokio::test]
async fn scenario_c_composite_task_runs_steps_in_order() {
    let mut registry = HandlerRegistry::new();
    registry.register("step", Succeeds);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let steps = vec![
        StepDescriptor {
            name: "first".to_string(),
            classification: Some("step".to_string()),
            input: json!({"n": 1}),
        },
        StepDescriptor {
            name: "second".to_string(),
            classification: Some("step".to_string()),
            input: json!({"n": 2}),
        },
    ];

    let task = engine
        .submit(
            "step",
            Atomicity::Composite,
            json!({}),
            1,
            &BackoffPolicy::default(),
            Some(&steps),
        )
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status.is_terminal()).await;
    assert_eq!(final_task.status, TaskStatus::Succeeded);
    assert_eq!(final_task.step_results.len(), 2);
    assert_eq!(final_task.current_step, 2);
    assert_eq!(final_task.step_results[1].output, Some(json!({"n": 2})));

    engine.stop().await;
}

#[tokio::test]
async fn composite_task_stops_at_first_failing_step() {
    let mut registry = HandlerRegistry::new();
    registry.register("ok", Succeeds);
    registry.register("bad", AlwaysFails);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let steps = vec![
        StepDescriptor {
            name: "first".to_string(),
            classification: Some("ok".to_string()),
            input: json!({}),
        },
        StepDescriptor {
            name: "second".to_string(),
            classification: Some("bad".to_string()),
            input: json!({}),
        },
        StepDescriptor {
            name: "third".to_string(),
            classification: Some("ok".to_string()),
            input: json!({}),
        },
    ];

    let task = engine
        .submit("ok", Atomicity::Composite, json!({}), 1, &BackoffPolicy::default(), Some(&steps))
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status.is_terminal()).await;
    assert_eq!(final_task.status, TaskStatus::Failed);
    assert_eq!(final_task.step_results.len(), 2);
    // current_step stays at the failed step's own index (1), not past it,
    // so a retried attempt resumes at "second" instead of skipping it.
    assert_eq!(final_task.current_step, 1);

    engine.stop().await;
}

#[tokio::test]
async fn handler_requested_cancel_bypasses_retry_accounting() {
    let mut registry = HandlerRegistry::new();
    registry.register("cancel-me", RequestsCancel);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let task = engine
        .submit("cancel-me", Atomicity::Simple, json!({}), 5, &BackoffPolicy::default(), None)
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status.is_terminal()).await;
    assert_eq!(final_task.status, TaskStatus::Canceled);
    assert_eq!(final_task.attempt, 0);

    engine.stop().await;
}

#[tokio::test]
async fn handler_requested_pause_clears_lease_on_running_task() {
    let mut registry = HandlerRegistry::new();
    registry.register("pause-me", RequestsPause);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));
    engine.start().await;

    let task = engine
        .submit("pause-me", Atomicity::Simple, json!({}), 5, &BackoffPolicy::default(), None)
        .await
        .unwrap();

    let final_task = run_until(&repository, task.id, |t| t.status == TaskStatus::Paused).await;
    assert_eq!(final_task.status, TaskStatus::Paused);
    assert!(final_task.lease_owner.is_none());

    engine.stop().await;
}

#[tokio::test]
async fn cancel_before_claim_transitions_directly() {
    let registry = HandlerRegistry::new();
    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        EngineConfig {
            // No scan loop iteration should be required to see the
            // cancellation land, since the task is never claimed.
            poll_ms_idle: 1_000,
            poll_ms_busy: 1_000,
            ..EngineConfig::default()
        },
    ));

    let task = engine
        .submit("never-run", Atomicity::Simple, json!({}), 3, &BackoffPolicy::default(), None)
        .await
        .unwrap();

    engine.cancel(task.id).await.unwrap();

    let saved = repository.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(saved.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn cancel_on_terminal_task_is_a_no_op() {
    let registry = HandlerRegistry::new();
    let repository = Arc::new(InMemoryTaskRepository::new());
    let bus = Arc::new(BroadcastEventBus::new(16));

    let engine = Arc::new(TaskEngine::new(
        repository.clone(),
        Arc::new(registry),
        bus,
        fast_engine_config(),
    ));

    let task = engine
        .submit("noop", Atomicity::Simple, json!({}), 1, &BackoffPolicy::default(), None)
        .await
        .unwrap();
    repository.complete_task(task.id, "nobody", json!({})).await.ok();
    // complete_task requires a matching lease owner; force the terminal
    // state directly for this no-op check instead.
    let mut saved = repository.get_task(task.id).await.unwrap().unwrap();
    saved.status = TaskStatus::Succeeded;
    repository.insert(saved);

    engine.cancel(task.id).await.unwrap();

    let after = repository.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Succeeded);
}
