//! `task-engine status` command: show a single task's detail, or a recent
//! listing plus the fleet-wide count summary when no task ID is given.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use task_engine_db::queries::tasks as task_db;

/// Run the status command.
///
/// When `task_id_str` is `Some`, shows detailed status for that task.
/// When `None`, lists the most recent tasks with a status-count summary.
pub async fn run_status(pool: &PgPool, task_id_str: Option<&str>) -> Result<()> {
    match task_id_str {
        Some(id_str) => run_task_status(pool, id_str).await,
        None => run_fleet_status(pool).await,
    }
}

/// Show detailed status for a single task.
async fn run_task_status(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.classification, task.id);
    println!("Status: {}  Atomicity: {:?}", task.status, task.atomicity);
    println!("Attempt: {}/{}", task.attempt, task.max_attempts);
    if let Some(owner) = &task.lease_owner {
        println!("Lease owner: {owner}");
    }
    if let Some(next_run_at) = task.next_run_at {
        println!("Next run at: {}", next_run_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &task.error {
        println!("Error: {error}");
    }
    if let Some(steps) = &task.steps {
        println!("Steps: {}/{} completed", task.current_step, steps.len());
        for (i, result) in task.step_results.iter().enumerate() {
            println!("  [{i}] {:?}", result.status);
        }
    }
    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated: {}", task.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if !task.log_tail.is_empty() {
        println!();
        println!("Log tail ({} entries):", task.log_tail.len());
        for entry in &task.log_tail {
            println!("  [{:?}] {}", entry.level, entry.message);
        }
    }

    Ok(())
}

/// List the most recent tasks, with a status-count summary at the top.
async fn run_fleet_status(pool: &PgPool) -> Result<()> {
    let counts = task_db::get_task_counts(pool).await?;
    println!(
        "total={} created={} scheduled={} claimed={} running={} waiting_retry={} \
         succeeded={} failed={} canceled={} paused={}",
        counts.total,
        counts.created,
        counts.scheduled,
        counts.claimed,
        counts.running,
        counts.waiting_retry,
        counts.succeeded,
        counts.failed,
        counts.canceled,
        counts.paused,
    );
    println!();

    let tasks = task_db::list_recent_tasks(pool, 20).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<14} {:>9}", "ID", "CLASSIFICATION", "STATUS", "ATTEMPT");
    println!("{}", "-".repeat(90));
    for task in &tasks {
        println!(
            "{:<38} {:<24} {:<14} {:>5}/{:<3}",
            task.id, task.classification, task.status, task.attempt, task.max_attempts
        );
    }

    Ok(())
}
