//! Configuration system
//!
//! Handles loading configuration from TOML files and environment
//! variables. Environment variables override file settings.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage layer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all data
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Hex digits of fingerprint used for shard directory names
    #[serde(default = "default_series_dir_name_len")]
    pub series_dir_name_len: usize,

    /// Force the full reconciliation path during crash recovery
    #[serde(default)]
    pub pedantic_checks: bool,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tempora").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tempora_data".to_string())
}

fn default_series_dir_name_len() -> usize {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            series_dir_name_len: default_series_dir_name_len(),
            pedantic_checks: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tempora").join("config.toml")),
            Some(PathBuf::from("/etc/tempora/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("TEMPORA_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Ok(len) = std::env::var("TEMPORA_SERIES_DIR_NAME_LEN") {
            if let Ok(len) = len.parse() {
                self.storage.series_dir_name_len = len;
            }
        }
        if let Ok(pedantic) = std::env::var("TEMPORA_PEDANTIC_CHECKS") {
            self.storage.pedantic_checks = pedantic == "1" || pedantic == "true";
        }
        if let Ok(level) = std::env::var("TEMPORA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TEMPORA_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.series_dir_name_len, 2);
        assert!(!config.storage.pedantic_checks);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            data_dir = "/var/lib/tempora"
            series_dir_name_len = 1
            pedantic_checks = true

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.data_dir, "/var/lib/tempora");
        assert_eq!(config.storage.series_dir_name_len, 1);
        assert!(config.storage.pedantic_checks);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }
}
