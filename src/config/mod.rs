//! Relay configuration.
//!
//! Loaded in layers (defaults, global file, explicit file, environment) by
//! [`ConfigLoader`]. Durations are plain integers so every key can be set
//! from a TOML file or an `AGENT_RELAY__SECTION__KEY` variable.

mod loader;
pub mod paths;

pub use loader::ConfigLoader;

use crate::error::RelayError;
pub use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One JSON file per record; safe across processes
    File,
    /// Embedded sled database; single process only
    Sled,
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_stale_ms() -> u64 {
    10_000
}

fn default_io_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    10
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Root directory for relay state; None means the platform data dir
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,

    /// Retries after the first attempt for transient I/O errors
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_stale_ms: default_lock_stale_ms(),
            io_retries: default_io_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl StorageConfig {
    pub fn resolve_data_dir(&self) -> Result<PathBuf, RelayError> {
        match &self.data_dir {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.clone()),
            _ => paths::default_data_dir(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_timeout_secs() -> u64 {
    600
}

/// Register/wait protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Interval between store reads while a caller is blocked
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout applied when a caller does not give one
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl FlowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_retention_hours() -> u64 {
    24
}

/// Janitor sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Idle conversations and finished records older than this are deleted
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// `None` when the window is too large to represent, i.e. nothing ages out.
    pub fn retention(&self) -> Option<chrono::Duration> {
        i64::try_from(self.retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.retention().is_none() {
            return Err(RelayError::ConfigError(format!(
                "janitor.retention_hours = {} is out of range",
                self.retention_hours
            )));
        }
        Ok(())
    }
}
