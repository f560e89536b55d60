mod config;
mod status_cmd;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use task_engine_core::bus::BroadcastEventBus;
use task_engine_core::config::EngineConfigOverrides;
use task_engine_core::engine::TaskEngine;
use task_engine_core::handler::HandlerRegistry;
use task_engine_core::repository::PgTaskRepository;
use task_engine_db::models::{Atomicity, BackoffPolicy};
use task_engine_db::{pool, queries::tasks as task_db};

use config::{ConfigFile, DatabaseSection, ResolvedConfig};

/// A `TaskEngine` wired to the real database but never started: the CLI
/// only needs its `cancel`/`pause`/`resume` request routing (leased tasks
/// get a `pending_request`, unleased ones transition directly), not the
/// scan loop.
fn cli_engine(db_pool: sqlx::PgPool, engine_config: task_engine_core::config::EngineConfig) -> TaskEngine {
    TaskEngine::new(
        Arc::new(PgTaskRepository::new(db_pool)),
        Arc::new(HandlerRegistry::new()),
        Arc::new(BroadcastEventBus::new(1)),
        engine_config,
    )
}

#[derive(Parser)]
#[command(name = "task-engine", about = "Operator CLI for the task-engine scheduler")]
struct Cli {
    /// Database URL (overrides TASK_ENGINE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a task-engine config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/task_engine")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the task-engine database and run migrations
    DbInit,
    /// Submit a new task
    Submit {
        /// Handler classification
        classification: String,
        /// JSON input payload (default: `{}`)
        #[arg(long, default_value = "{}")]
        input: String,
        /// Maximum attempts before the task is failed terminally
        #[arg(long, default_value_t = 3)]
        max_attempts: i32,
    },
    /// Show a task's detail (omit task_id to list recent tasks)
    Status {
        /// Task ID to show (omit to list recent tasks)
        task_id: Option<String>,
    },
    /// Request cancellation of a task
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },
    /// Request a task be paused
    Pause {
        /// Task ID to pause
        task_id: String,
    },
    /// Request a paused task resume (moves it back to scheduled)
    Resume {
        /// Task ID to resume
        task_id: String,
    },
}

/// Execute the `task-engine init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_string(),
        },
        ..Default::default()
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `task-engine db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `task-engine db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ResolvedConfig::resolve(cli_db_url, &EngineConfigOverrides::default());

    println!("Initializing task-engine database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("task-engine db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Submit {
            classification,
            input,
            max_attempts,
        } => {
            let resolved = ResolvedConfig::resolve(
                cli.database_url.as_deref(),
                &EngineConfigOverrides::default(),
            );
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;
            let task = task_db::insert_task(
                &db_pool,
                &classification,
                Atomicity::Simple,
                input,
                max_attempts,
                &BackoffPolicy::default(),
                None,
            )
            .await?;
            db_pool.close().await;
            println!("Submitted task {}", task.id);
        }
        Commands::Status { task_id } => {
            let resolved = ResolvedConfig::resolve(
                cli.database_url.as_deref(),
                &EngineConfigOverrides::default(),
            );
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, task_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Cancel { task_id } => {
            let resolved = ResolvedConfig::resolve(
                cli.database_url.as_deref(),
                &EngineConfigOverrides::default(),
            );
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let engine = cli_engine(db_pool.clone(), resolved.engine);
            let result = engine.cancel(id).await;
            db_pool.close().await;
            result?;
            println!("Task {task_id} canceled.");
        }
        Commands::Pause { task_id } => {
            let resolved = ResolvedConfig::resolve(
                cli.database_url.as_deref(),
                &EngineConfigOverrides::default(),
            );
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let engine = cli_engine(db_pool.clone(), resolved.engine);
            let result = engine.pause(id).await;
            db_pool.close().await;
            result?;
            println!("Task {task_id} paused.");
        }
        Commands::Resume { task_id } => {
            let resolved = ResolvedConfig::resolve(
                cli.database_url.as_deref(),
                &EngineConfigOverrides::default(),
            );
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let engine = cli_engine(db_pool.clone(), resolved.engine);
            let result = engine.resume(id).await;
            db_pool.close().await;
            result?;
            println!("Task {task_id} resumed.");
        }
    }

    Ok(())
}
