//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::bus::MessagingConfig;
use crate::services::{EngineConfig, ProgressConfig, ReconcilerConfig};
use crate::storage::StorageConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "rendezvous.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RENDEZVOUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RENDEZVOUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RENDEZVOUS_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Notify API configuration.
    pub engine: EngineConfig,
    /// Background reconciler configuration.
    pub reconciler: ReconcilerConfig,
    /// Progress dispatcher configuration.
    pub progress: ProgressConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `rendezvous.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `RENDEZVOUS_CONFIG` (if set)
    /// 4. Environment variables `RENDEZVOUS__SECTION__KEY`
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

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or spin the background tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciler.page_size == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.page_size must be positive".to_string(),
            ));
        }
        if self.reconciler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.interval_secs must be positive".to_string(),
            ));
        }
        if self.progress.enabled && self.progress.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "progress.interval_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.messaging.drop_rate) {
            return Err(ConfigError::Invalid(
                "messaging.drop_rate must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing: in-memory store, fast background loops.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.storage_type = crate::storage::StorageType::Memory;
        config.reconciler.interval_secs = 1;
        config.reconciler.max_initial_delay_secs = 0;
        config.reconciler.drained_grace_secs = 0;
        config.progress.interval_ms = 50;
        config
    }
}
