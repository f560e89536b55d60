//! `EngineConfig`: the tunables governing scan cadence, leases, logging
//! buffers, and worker pool shape.
//!
//! Resolution follows the same chain as the CLI's own config file (CLI
//! flag > env var > config file > default), but the file section lives
//! under `[engine]` in the same `task-engine` config file the CLI reads,
//! so operators tune both database and engine behavior from one place.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Worker pool shape: exactly `size` worker threads, each honoring
/// `workerConcurrency` slots of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { size: 0 }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inline-mode concurrency cap (ignored when a worker pool is active,
    /// where the effective cap is `worker_pool.size * worker_concurrency`).
    pub concurrency: usize,
    /// Lease duration in milliseconds granted on claim and on heartbeat.
    pub lease_ms: i64,
    /// Poll interval used when the previous scan dispatched nothing.
    pub poll_ms_idle: u64,
    /// Poll interval used when the previous scan dispatched at least one task.
    pub poll_ms_busy: u64,
    /// Maximum entries retained in a task's persisted `log_tail`.
    pub log_tail_max: usize,
    /// Chunk size `TaskLogger::flush` uses when draining to the pipe.
    pub stream_buffer_size: usize,
    /// Ring-buffer capacity before truncation kicks in.
    pub max_logging_buffer: usize,
    /// Number of oldest entries dropped per truncation event.
    pub logging_buffer_truncation: usize,
    /// Budget `stop()` gives outstanding handlers before workers are terminated.
    pub graceful_shutdown_ms_timeout: u64,
    /// Per-worker concurrent job capacity.
    pub worker_concurrency: usize,
    pub worker_pool: WorkerPoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_ms: 30_000,
            poll_ms_idle: 1_000,
            poll_ms_busy: 50,
            log_tail_max: 200,
            stream_buffer_size: 20,
            max_logging_buffer: 1_000,
            logging_buffer_truncation: 100,
            graceful_shutdown_ms_timeout: 30_000,
            worker_concurrency: 4,
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Whether this configuration runs with a worker pool at all.
    pub fn pool_enabled(&self) -> bool {
        self.worker_pool.size > 0
    }

    /// The effective execution-concurrency cap the scan loop honors:
    /// `inlineConcurrency` with no pool, else `workerCount * workerConcurrency`.
    pub fn effective_concurrency(&self) -> usize {
        if self.pool_enabled() {
            self.worker_pool.size * self.worker_concurrency
        } else {
            self.concurrency
        }
    }
}

// -----------------------------------------------------------------------
// Config file section
// -----------------------------------------------------------------------

/// The `[engine]` section of the CLI's TOML config file. All fields are
/// optional in the file; anything absent falls back to `EngineConfig::default()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigFile {
    pub concurrency: Option<usize>,
    pub lease_ms: Option<i64>,
    pub poll_ms_idle: Option<u64>,
    pub poll_ms_busy: Option<u64>,
    pub log_tail_max: Option<usize>,
    pub stream_buffer_size: Option<usize>,
    pub max_logging_buffer: Option<usize>,
    pub logging_buffer_truncation: Option<usize>,
    pub graceful_shutdown_ms_timeout: Option<u64>,
    pub worker_concurrency: Option<usize>,
    pub worker_pool_size: Option<usize>,
}

/// Overrides collected from CLI flags; `None` means "not specified on the
/// command line", deferring to env/file/default.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigOverrides {
    pub concurrency: Option<usize>,
    pub lease_ms: Option<i64>,
    pub poll_ms_idle: Option<u64>,
    pub poll_ms_busy: Option<u64>,
    pub worker_pool_size: Option<usize>,
    pub worker_concurrency: Option<usize>,
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Resolve using the chain CLI flag > env var > config file > default.
    ///
    /// Env vars are prefixed `TASK_ENGINE_` (e.g. `TASK_ENGINE_LEASE_MS`).
    pub fn resolve(overrides: &EngineConfigOverrides, file: Option<&EngineConfigFile>) -> Self {
        let default = EngineConfig::default();

        let concurrency = overrides
            .concurrency
            .or_else(|| env_usize("TASK_ENGINE_CONCURRENCY"))
            .or_else(|| file.and_then(|f| f.concurrency))
            .unwrap_or(default.concurrency);

        let lease_ms = overrides
            .lease_ms
            .or_else(|| env_i64("TASK_ENGINE_LEASE_MS"))
            .or_else(|| file.and_then(|f| f.lease_ms))
            .unwrap_or(default.lease_ms);

        let poll_ms_idle = overrides
            .poll_ms_idle
            .or_else(|| env_u64("TASK_ENGINE_POLL_MS_IDLE"))
            .or_else(|| file.and_then(|f| f.poll_ms_idle))
            .unwrap_or(default.poll_ms_idle);

        let poll_ms_busy = overrides
            .poll_ms_busy
            .or_else(|| env_u64("TASK_ENGINE_POLL_MS_BUSY"))
            .or_else(|| file.and_then(|f| f.poll_ms_busy))
            .unwrap_or(default.poll_ms_busy);

        let log_tail_max = env_usize("TASK_ENGINE_LOG_TAIL_MAX")
            .or_else(|| file.and_then(|f| f.log_tail_max))
            .unwrap_or(default.log_tail_max);

        let stream_buffer_size = env_usize("TASK_ENGINE_STREAM_BUFFER_SIZE")
            .or_else(|| file.and_then(|f| f.stream_buffer_size))
            .unwrap_or(default.stream_buffer_size);

        let max_logging_buffer = env_usize("TASK_ENGINE_MAX_LOGGING_BUFFER")
            .or_else(|| file.and_then(|f| f.max_logging_buffer))
            .unwrap_or(default.max_logging_buffer);

        let logging_buffer_truncation = env_usize("TASK_ENGINE_LOGGING_BUFFER_TRUNCATION")
            .or_else(|| file.and_then(|f| f.logging_buffer_truncation))
            .unwrap_or(default.logging_buffer_truncation);

        let graceful_shutdown_ms_timeout = env_u64("TASK_ENGINE_GRACEFUL_SHUTDOWN_MS_TIMEOUT")
            .or_else(|| file.and_then(|f| f.graceful_shutdown_ms_timeout))
            .unwrap_or(default.graceful_shutdown_ms_timeout);

        let worker_concurrency = overrides
            .worker_concurrency
            .or_else(|| env_usize("TASK_ENGINE_WORKER_CONCURRENCY"))
            .or_else(|| file.and_then(|f| f.worker_concurrency))
            .unwrap_or(default.worker_concurrency);

        let worker_pool_size = overrides
            .worker_pool_size
            .or_else(|| env_usize("TASK_ENGINE_WORKER_POOL_SIZE"))
            .or_else(|| file.and_then(|f| f.worker_pool_size))
            .unwrap_or(default.worker_pool.size);

        Self {
            concurrency,
            lease_ms,
            poll_ms_idle,
            poll_ms_busy,
            log_tail_max,
            stream_buffer_size,
            max_logging_buffer,
            logging_buffer_truncation,
            graceful_shutdown_ms_timeout,
            worker_concurrency,
            worker_pool: WorkerPoolConfig {
                size: worker_pool_size,
            },
        }
    }
}

// -----------------------------------------------------------------------
// XDG config directory helpers, shared with the CLI's own config loader.
// -----------------------------------------------------------------------

/// `$XDG_CONFIG_HOME/task-engine` or `~/.config/task-engine`.
///
/// Deliberately ignores `dirs::config_dir()`'s platform-specific behavior
/// (e.g. `~/Library/Application Support` on macOS) in favor of explicit
/// XDG layout everywhere.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("task-engine");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("task-engine")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load `EngineConfigFile` out of a parsed generic TOML document, if the
/// config file exists. Absence is not an error; it simply yields `None`.
pub fn load_engine_section(raw_toml: &str) -> Result<EngineConfigFile> {
    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default)]
        engine: EngineConfigFile,
    }
    let wrapper: Wrapper =
        toml::from_str(raw_toml).context("failed to parse [engine] section of config file")?;
    Ok(wrapper.engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.lease_ms, 30_000);
        assert!(!cfg.pool_enabled());
        assert_eq!(cfg.effective_concurrency(), cfg.concurrency);
    }

    #[test]
    fn effective_concurrency_uses_pool_when_enabled() {
        let cfg = EngineConfig {
            worker_pool: WorkerPoolConfig { size: 3 },
            worker_concurrency: 5,
            ..EngineConfig::default()
        };
        assert!(cfg.pool_enabled());
        assert_eq!(cfg.effective_concurrency(), 15);
    }

    #[test]
    fn cli_override_wins_over_file_and_env() {
        unsafe { std::env::set_var("TASK_ENGINE_LEASE_MS", "9999") };
        let file = EngineConfigFile {
            lease_ms: Some(5000),
            ..Default::default()
        };
        let overrides = EngineConfigOverrides {
            lease_ms: Some(1234),
            ..Default::default()
        };
        let resolved = EngineConfig::resolve(&overrides, Some(&file));
        unsafe { std::env::remove_var("TASK_ENGINE_LEASE_MS") };
        assert_eq!(resolved.lease_ms, 1234);
    }

    #[test]
    fn env_wins_over_file_when_no_cli_flag() {
        unsafe { std::env::set_var("TASK_ENGINE_POLL_MS_IDLE", "777") };
        let file = EngineConfigFile {
            poll_ms_idle: Some(5000),
            ..Default::default()
        };
        let resolved = EngineConfig::resolve(&EngineConfigOverrides::default(), Some(&file));
        unsafe { std::env::remove_var("TASK_ENGINE_POLL_MS_IDLE") };
        assert_eq!(resolved.poll_ms_idle, 777);
    }

    #[test]
    fn file_wins_over_default_when_no_override() {
        let file = EngineConfigFile {
            max_logging_buffer: Some(42),
            ..Default::default()
        };
        let resolved = EngineConfig::resolve(&EngineConfigOverrides::default(), Some(&file));
        assert_eq!(resolved.max_logging_buffer, 42);
    }

    #[test]
    fn falls_back_to_default_with_nothing_set() {
        let resolved = EngineConfig::resolve(&EngineConfigOverrides::default(), None);
        assert_eq!(resolved, EngineConfig::default());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("task-engine/config.toml"));
    }
}
