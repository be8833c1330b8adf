//! Platform directories for relay state, configuration and logs.

use crate::error::RelayError;
use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Result<ProjectDirs, RelayError> {
    ProjectDirs::from("", "", "agent-relay").ok_or_else(|| {
        RelayError::ConfigError(
            "Could not determine platform directories (HOME not set)".to_string(),
        )
    })
}

/// `$XDG_DATA_HOME/agent-relay` on Linux
pub fn default_data_dir() -> Result<PathBuf, RelayError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// `$XDG_CONFIG_HOME/agent-relay/config.toml` on Linux
pub fn global_config_file() -> Option<PathBuf> {
    project_dirs()
        .ok()
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Default log file under the platform state (or cache) directory
pub fn default_log_file() -> Result<PathBuf, RelayError> {
    let dirs = project_dirs()?;
    let dir = dirs
        .state_dir()
        .map(|d| d.to_path_buf())
        .unwrap_or_else(|| dirs.cache_dir().to_path_buf());
    Ok(dir.join("agent-relay.log"))
}
