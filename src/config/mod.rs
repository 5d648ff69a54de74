//! Configuration module for the preprocessing service
//!
//! This module handles:
//! - Runtime settings of the manager and worker pool ([`PreprocConfig`])
//! - Logging settings ([`LogConfig`])
//! - The item configuration model and its sources ([`items`])
//!
//! # Config Location
//!
//! Without an explicit `--config` path the service looks for
//! `preprocd.toml` in the platform configuration directory:
//! - **Linux**: `~/.config/dev.hxyulin.preproc-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.preproc-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.preproc-rs\`
//!
//! # Example
//!
//! ```toml
//! items_file = "items.toml"
//!
//! [preprocessing]
//! workers = 4
//! max_error_len = 1024
//!
//! [log]
//! filter = "info,preproc_rs=debug"
//! ```

pub mod items;

pub use items::{ConfigSource, DependentItem, ItemConfig, StaticConfigSource};

use crate::error::{PreprocError, Result};
use crate::types::ITEM_ERROR_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "dev.hxyulin.preproc-rs";

/// Config filename
pub const CONFIG_FILE: &str = "preprocd.toml";

/// Default number of workers in the pool
pub const DEFAULT_WORKERS: usize = 3;

/// Values packed into one ingest message by collectors
pub const MAX_VALUES_LOCAL: usize = 256;

/// Characters of a value shown per step in failure diagnostics
pub const VALUE_PREVIEW_LEN: usize = 100;

/// Platform path of the default config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_manager_delay_ms() -> u64 {
    1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_stat_interval_secs() -> u64 {
    5
}

fn default_config_sync_interval_ms() -> u64 {
    1000
}

fn default_max_error_len() -> usize {
    ITEM_ERROR_LEN
}

fn default_value_preview_len() -> usize {
    VALUE_PREVIEW_LEN
}

fn default_batch_size() -> usize {
    MAX_VALUES_LOCAL
}

fn default_test_timeout_secs() -> u64 {
    60
}

fn default_log_filter() -> String {
    "info,preproc_rs=debug".to_string()
}

/// Manager and worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocConfig {
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Longest blocking wait of the manager loop
    #[serde(default = "default_manager_delay_ms")]
    pub manager_delay_ms: u64,

    /// Forced flush period for completed values
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Statistics log period
    #[serde(default = "default_stat_interval_secs")]
    pub stat_interval_secs: u64,

    /// Item configuration refresh period
    #[serde(default = "default_config_sync_interval_ms")]
    pub config_sync_interval_ms: u64,

    /// Longest item error message, in characters
    #[serde(default = "default_max_error_len")]
    pub max_error_len: usize,

    /// Longest value preview per step in failure diagnostics
    #[serde(default = "default_value_preview_len")]
    pub value_preview_len: usize,

    /// Values per ingest message sent by [`crate::pipeline::ValueBatcher`]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a test-mode client waits for its reply
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
}

impl Default for PreprocConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            manager_delay_ms: default_manager_delay_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            stat_interval_secs: default_stat_interval_secs(),
            config_sync_interval_ms: default_config_sync_interval_ms(),
            max_error_len: default_max_error_len(),
            value_preview_len: default_value_preview_len(),
            batch_size: default_batch_size(),
            test_timeout_secs: default_test_timeout_secs(),
        }
    }
}

impl PreprocConfig {
    pub fn manager_delay(&self) -> Duration {
        Duration::from_millis(self.manager_delay_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stat_interval(&self) -> Duration {
        Duration::from_secs(self.stat_interval_secs)
    }

    pub fn config_sync_interval(&self) -> Duration {
        Duration::from_millis(self.config_sync_interval_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PreprocError::Config(
                "at least one worker is required".to_string(),
            ));
        }
        if self.max_error_len < 16 {
            return Err(PreprocError::Config(format!(
                "max_error_len {} is too small",
                self.max_error_len
            )));
        }
        if self.value_preview_len < 4 {
            return Err(PreprocError::Config(format!(
                "value_preview_len {} is too small",
                self.value_preview_len
            )));
        }
        if self.batch_size == 0 {
            return Err(PreprocError::Config("batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Directory for a daily rolling log file
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            directory: None,
        }
    }
}

/// Top-level service configuration file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Item configuration store
    #[serde(default)]
    pub items_file: Option<PathBuf>,

    #[serde(default)]
    pub preprocessing: PreprocConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PreprocError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let mut config: AppConfig = toml::from_str(&content).map_err(|e| {
            PreprocError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        // Relative item stores are resolved against the config file location
        if let (Some(items), Some(parent)) = (config.items_file.as_ref(), path.parent()) {
            if items.is_relative() {
                config.items_file = Some(parent.join(items));
            }
        }

        config.preprocessing.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Save config file to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PreprocError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PreprocError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            PreprocError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PreprocConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_error_len, 2048);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.manager_delay(), Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [preprocessing]
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.preprocessing.workers, 8);
        assert_eq!(config.preprocessing.flush_interval_ms, 1000);
        assert_eq!(config.log, LogConfig::default());
        assert!(config.items_file.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = PreprocConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PreprocError::Config(_))));
    }

    #[test]
    fn test_default_config_path_name() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with(CONFIG_FILE));
        }
    }
}
