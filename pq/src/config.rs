//! pushqueue configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::channel::CommandChannelConfig;
use crate::dispatch::DEFAULT_RETRIES;
use crate::scheduler::SchedulerConfig;

/// Main pushqueue configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Worker pool and polling
    pub scheduler: SchedulerConfig,

    /// Dispatch defaults
    pub dispatch: DispatchConfig,

    /// Remote call channel
    pub channel: CommandChannelConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.pool_size == 0 {
            return Err(eyre::eyre!("scheduler.pool-size must be at least 1"));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(eyre::eyre!("scheduler.poll-interval-secs must be at least 1"));
        }
        if self.channel.program.trim().is_empty() {
            return Err(eyre::eyre!("channel.program must not be empty"));
        }
        if self.channel.timeout_ms == 0 {
            return Err(eyre::eyre!("channel.timeout-ms must be positive"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .pushqueue.yml
        let local_config = PathBuf::from(".pushqueue.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/pushqueue/pushqueue.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pushqueue").join("pushqueue.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Dispatch defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retry budget for actions created without an explicit one
    #[serde(rename = "default-retries")]
    pub default_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_retries: DEFAULT_RETRIES,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/pushqueue on Linux)
        let db_path = dirs::data_dir()
            .map(|d| d.join("pushqueue"))
            .unwrap_or_else(|| PathBuf::from(".pushqueue"))
            .join("pushqueue.db")
            .to_string_lossy()
            .into_owned();

        Self { db_path }
    }
}
