//! Configuration file management for the CLI.
//!
//! Provides a TOML-based config file at `$XDG_CONFIG_HOME/task-engine/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default. The
//! file's `[engine]` section is shared with `task_engine_core::config`, so
//! operators tune database and engine behavior from one place.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use task_engine_core::config::{EngineConfig, EngineConfigFile, EngineConfigOverrides};
use task_engine_db::config::DbConfig;

pub use task_engine_core::config::{config_dir, config_path};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub engine: EngineConfigFile,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_string(),
        }
    }
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub db_config: DbConfig,
    pub engine: EngineConfig,
}

impl ResolvedConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// DB URL: `cli_db_url` > `TASK_ENGINE_DATABASE_URL` env >
    /// `config_file.database.url` > `DbConfig::DEFAULT_URL`. Engine tunables
    /// go through `EngineConfig::resolve`, which applies the same chain
    /// field by field.
    pub fn resolve(cli_db_url: Option<&str>, overrides: &EngineConfigOverrides) -> Self {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TASK_ENGINE_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let engine = EngineConfig::resolve(overrides, file_config.as_ref().map(|f| &f.engine));

        Self {
            db_config: DbConfig::new(db_url),
            engine,
        }
    }
}
