//! ConfigLoader: merges defaults, files and environment into [`RelayConfig`].

use super::{paths, RelayConfig};
use crate::error::RelayError;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use std::path::Path;

/// Prefix for environment overrides, e.g. `AGENT_RELAY__FLOW__POLL_INTERVAL_MS`
pub const ENV_PREFIX: &str = "AGENT_RELAY";

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration.
    /// Precedence: defaults (lowest) -> global file -> `explicit` file -> environment (highest).
    pub fn load(explicit: Option<&Path>) -> Result<RelayConfig, RelayError> {
        let global = paths::global_config_file();
        Self::load_layers(global.as_deref(), explicit)
    }

    /// Load with explicit layer locations; a missing global file is skipped,
    /// a missing explicit file is an error.
    pub fn load_layers(
        global: Option<&Path>,
        explicit: Option<&Path>,
    ) -> Result<RelayConfig, RelayError> {
        let mut builder = builder_with_defaults()?;
        if let Some(global) = global {
            builder = builder.add_source(File::from(global).format(FileFormat::Toml).required(false));
        }
        if let Some(explicit) = explicit {
            if !explicit.exists() {
                return Err(RelayError::ConfigError(format!(
                    "Config file not found: {}",
                    explicit.display()
                )));
            }
            builder = builder.add_source(File::from(explicit).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RelayConfig = builder.build()?.try_deserialize()?;
        config.janitor.validate()?;
        Ok(config)
    }

    /// Render a configuration as TOML.
    pub fn to_toml(config: &RelayConfig) -> Result<String, RelayError> {
        toml::to_string_pretty(config)
            .map_err(|e| RelayError::ConfigError(format!("Failed to render config: {}", e)))
    }
}

fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, RelayError> {
    let defaults = Config::try_from(&RelayConfig::default())?;
    Ok(Config::builder().add_source(defaults))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_files() {
        let config = ConfigLoader::load_layers(None, None).unwrap();
        assert_eq!(config.flow.poll_interval_ms, 250);
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn test_explicit_file_overrides_global() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("global.toml");
        let explicit = dir.path().join("explicit.toml");
        fs::write(&global, "[janitor]\nretention_hours = 48\ninterval_secs = 5\n").unwrap();
        fs::write(&explicit, "[janitor]\nretention_hours = 2\n").unwrap();

        let config = ConfigLoader::load_layers(Some(&global), Some(&explicit)).unwrap();
        assert_eq!(config.janitor.retention_hours, 2);
        assert_eq!(config.janitor.interval_secs, 5);
    }

    #[test]
    fn test_missing_global_is_skipped_missing_explicit_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ConfigLoader::load_layers(Some(&missing), None).is_ok());
        assert!(matches!(
            ConfigLoader::load_layers(None, Some(&missing)),
            Err(RelayError::ConfigError(_))
        ));
    }

    #[test]
    fn test_out_of_range_retention_is_rejected() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("explicit.toml");
        fs::write(&explicit, "[janitor]\nretention_hours = 10000000000000\n").unwrap();
        assert!(matches!(
            ConfigLoader::load_layers(None, Some(&explicit)),
            Err(RelayError::ConfigError(_))
        ));
    }

    #[test]
    fn test_to_toml_round_trips_sections() {
        let rendered = ConfigLoader::to_toml(&RelayConfig::default()).unwrap();
        assert!(rendered.contains("[storage]"));
        assert!(rendered.contains("poll_interval_ms = 250"));
    }
}
