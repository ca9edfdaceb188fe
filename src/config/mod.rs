//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::lock::LockConfig;
use crate::storage::StorageConfig;
use crate::stream::StreamConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "strata.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STRATA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STRATA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STRATA_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where event type and timeline records, and lock leases, are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataType {
    #[default]
    Memory,
    Sqlite,
}

/// Metadata store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    #[serde(rename = "type")]
    pub metadata_type: MetadataType,
    pub sqlite: SqliteMetadataConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteMetadataConfig {
    /// Database file path.
    pub path: String,
}

impl Default for SqliteMetadataConfig {
    fn default() -> Self {
        Self {
            path: "data/strata-meta.db".to_string(),
        }
    }
}

/// Timeline lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimelinesConfig {
    /// Retention given to event types registered without one.
    pub default_retention_ms: u64,
    /// How often the background task retires drained timelines.
    pub retirement_interval_ms: u64,
}

impl TimelinesConfig {
    pub fn default_retention(&self) -> Duration {
        Duration::from_millis(self.default_retention_ms)
    }

    pub fn retirement_interval(&self) -> Duration {
        Duration::from_millis(self.retirement_interval_ms)
    }
}

impl Default for TimelinesConfig {
    fn default() -> Self {
        Self {
            default_retention_ms: 24 * 60 * 60 * 1000,
            retirement_interval_ms: 60_000,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Physical log storages.
    pub storage: StorageConfig,
    /// Timeline metadata and lock store.
    pub metadata: MetadataConfig,
    /// Distributed lock timing.
    pub lock: LockConfig,
    /// Streaming defaults.
    pub stream: StreamConfig,
    /// Timeline lifecycle.
    pub timelines: TimelinesConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `strata.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the broker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for backend in &self.storage.backends {
            if backend.id.is_empty() {
                return Err(ConfigError::Invalid("storage backend without id".to_string()));
            }
            if !ids.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "storage id {} configured twice",
                    backend.id
                )));
            }
        }
        if !ids.contains(self.storage.default.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "default storage {} is not configured",
                self.storage.default
            )));
        }
        if self.stream.batch_limit == 0 {
            return Err(ConfigError::Invalid("stream.batch_limit must be positive".to_string()));
        }
        if self.stream.flush_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.flush_timeout_ms must be positive".to_string(),
            ));
        }
        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream.channel_capacity must be positive".to_string(),
            ));
        }
        if self.lock.lease_ms == 0 {
            return Err(ConfigError::Invalid("lock.lease_ms must be positive".to_string()));
        }
        if self.timelines.retirement_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timelines.retirement_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
