//! TOML configuration.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration with an empty job catalog.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{Catalog, JobDefinition};
use crate::scheduler::{QueueSettings, SchedulerSettings};
use crate::storage::RetryPolicy;
use crate::supervisor::RunnerSettings;

pub const CONFIG_ENV: &str = "RUNLEDGER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "runledger.toml";
/// Start delay override for the run queue, in minutes.
pub const QUEUE_DELAY_ENV: &str = "CRON_START_DELAY_MINUTES";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), jobs = config.jobs.len(), "loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.apply_env();
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. `explicit` (the `--config` flag); a failure here is an error.
    /// 2. The path in `RUNLEDGER_CONFIG`.
    /// 3. `./runledger.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "RUNLEDGER_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }

        info!("no configuration file found, using defaults");
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(QUEUE_DELAY_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(minutes) => self.queue.start_delay_minutes = minutes,
                Err(_) => warn!(value = %raw, "ignoring invalid CRON_START_DELAY_MINUTES"),
            }
        }
    }

    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::new(self.jobs.clone()).context("invalid job catalog")
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            working_dir: self.runner.working_dir.clone(),
            timeout: Duration::from_secs(self.runner.timeout_secs),
            stop_grace: Duration::from_millis(self.runner.stop_grace_ms),
            output_lines: self.runner.output_buffer_lines,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick: Duration::from_secs(self.scheduler.tick_secs.max(1)),
            stop_timeout: Duration::from_secs(self.scheduler.stop_timeout_secs),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            start_delay: Duration::from_secs(self.queue.start_delay_minutes * 60),
            cooldown: Duration::from_secs(self.queue.cooldown_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.storage.busy_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP control surface listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Finished executions older than this are pruned.
    pub retention_days: u32,
    /// Backoff between attempts when the database is busy.
    pub busy_backoff_ms: Vec<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/runledger.db".to_string(),
            retention_days: 30,
            busy_backoff_ms: vec![500, 1000, 2000],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub stop_grace_ms: u64,
    pub output_buffer_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            timeout_secs: 3600,
            stop_grace_ms: 1000,
            output_buffer_lines: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub start_delay_minutes: u64,
    pub cooldown_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            start_delay_minutes: 0,
            cooldown_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// JSON-lines file; unset disables the activity log.
    pub path: Option<PathBuf>,
    pub max_entries: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data/activity.jsonl")),
            max_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.runner.timeout_secs, 3600);
        assert_eq!(config.runner.stop_grace_ms, 1000);
        assert_eq!(config.runner.output_buffer_lines, 1000);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.scheduler.stop_timeout_secs, 10);
        assert_eq!(config.queue.cooldown_secs, 2);
        assert_eq!(config.storage.busy_backoff_ms, vec![500, 1000, 2000]);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [storage]
            db_path = "/var/lib/runledger/ledger.db"
            retention_days = 7

            [runner]
            working_dir = "/srv/scripts"
            timeout_secs = 120

            [queue]
            start_delay_minutes = 5

            [logging]
            level = "debug"
            json = true

            [[jobs]]
            id = "scan"
            name = "Library scan"
            command = ["python3", "-u", "scan.py"]
            supports_dry_run = true
            accepts_input = true

            [[jobs]]
            id = "selftest"
            command = ["sh", "selftest.sh"]
            section = "tests"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.runner_settings().timeout, Duration::from_secs(120));
        assert_eq!(config.runner_settings().stop_grace, Duration::from_secs(1));
        assert_eq!(config.queue_settings().start_delay, Duration::from_secs(300));
        assert!(config.logging.json);

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.list().len(), 2);
        assert_eq!(catalog.sections(), vec!["commands", "tests"]);
    }

    #[test]
    fn test_invalid_catalog_is_an_error() {
        let config: AppConfig = toml::from_str(
            r#"
            [[jobs]]
            id = "a"
            command = ["true"]
            [[jobs]]
            id = "a"
            command = ["false"]
            "#,
        )
        .unwrap();
        assert!(config.catalog().is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(&dir.path().join("absent.toml")).is_err());
        assert!(AppConfig::resolve(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
