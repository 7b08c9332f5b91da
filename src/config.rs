//! Layered runtime configuration.
//!
//! Values come from `groupsync.toml`, then the environment, then CLI flags;
//! later layers win. Every field has a serde default so a missing file or a
//! partial one works.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! data_dir = "/var/lib/groupsync"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 500
//! backoff = "exponential"
//!
//! [run]
//! max_fan_out = 4
//! defer_minutes = 30
//! call_timeout_secs = 30
//! compression_level = 6
//!
//! [directory]
//! base_url = "https://directory.example.net/api"
//! token_env = "DIRECTORY_TOKEN"
//!
//! [downstream]
//! aggregator_url = "https://updater.example.net/membership-ready"
//! notification_webhook = "https://hooks.example.net/groupsync"
//!
//! [scheduler]
//! tick_secs = 60
//! max_concurrent_jobs = 2
//! stuck_after_hours = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::RunnerConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root for the database, artifacts and run state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("groupsync"))
        .unwrap_or_else(|| PathBuf::from(".groupsync"))
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries per remote call after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,
    #[serde(default = "default_defer_minutes")]
    pub defer_minutes: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

fn default_max_fan_out() -> usize {
    4
}

fn default_defer_minutes() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_compression_level() -> u32 {
    6
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_fan_out: default_max_fan_out(),
            defer_minutes: default_defer_minutes(),
            call_timeout_secs: default_call_timeout_secs(),
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownstreamConfig {
    #[serde(default)]
    pub aggregator_url: Option<String>,
    #[serde(default)]
    pub notification_webhook: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_stuck_after_hours")]
    pub stuck_after_hours: u64,
}

fn default_tick_secs() -> u64 {
    60
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_stuck_after_hours() -> u64 {
    2
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            stuck_after_hours: default_stuck_after_hours(),
        }
    }
}

/// Unified runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupsyncConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

impl GroupsyncConfig {
    /// Load configuration: file (explicit path or `./groupsync.toml`), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = PathBuf::from("groupsync.toml");
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("GROUPSYNC_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("GROUPSYNC_DIRECTORY_URL") {
            self.directory.base_url = Some(url);
        }
        if let Ok(url) = std::env::var("GROUPSYNC_AGGREGATOR_URL") {
            self.downstream.aggregator_url = Some(url);
        }
    }

    /// Override the data directory (CLI layer).
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.store.data_dir = dir;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.store.data_dir.join("jobs.db")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.store.data_dir.join("runs")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.store.data_dir.join("artifacts")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.store.data_dir)
            .context("Failed to create data directory")?;
        std::fs::create_dir_all(self.state_dir()).context("Failed to create run state directory")?;
        std::fs::create_dir_all(self.artifact_dir())
            .context("Failed to create artifact directory")?;
        Ok(())
    }

    /// The bearer token named by `directory.token_env`, if any.
    pub fn directory_token(&self) -> Option<String> {
        self.directory
            .token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.backoff,
        )
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            state_dir: self.state_dir(),
            retry: self.retry_policy(),
            call_timeout: Duration::from_secs(self.run.call_timeout_secs),
            max_fan_out: self.run.max_fan_out.max(1),
            defer: Duration::from_secs(self.run.defer_minutes * 60),
            compression_level: self.run.compression_level.min(9),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_secs(self.scheduler.tick_secs.max(1)),
            max_concurrent_jobs: self.scheduler.max_concurrent_jobs.max(1),
            stuck_after: Duration::from_secs(self.scheduler.stuck_after_hours * 60 * 60),
        }
    }
}
