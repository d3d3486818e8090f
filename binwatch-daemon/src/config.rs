//! Daemon configuration.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use thiserror::Error;

use binwatch_bus_mqtt::MqttSettings;
use binwatch_core::config::{EngineConfig, IngestConfig, RouterConfig};

/// Configuration errors.
#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    /// Failed to parse configuration.
    #[error("Configuration error: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
/// Full daemon configuration.
pub(crate) struct DaemonConfig {
    /// State machine thresholds and timers.
    #[serde(default)]
    pub(crate) engine: EngineConfig,

    /// Reading validation and deduplication.
    #[serde(default)]
    pub(crate) ingest: IngestConfig,

    /// Worker pool, sweep, and persistence retry settings.
    #[serde(default)]
    pub(crate) router: RouterConfig,

    /// MQTT broker connection.
    #[serde(default)]
    pub(crate) broker: MqttSettings,

    /// Database location.
    #[serde(default)]
    pub(crate) store: StoreSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Persistence settings.
pub(crate) struct StoreSettings {
    /// SQLite database file.
    pub(crate) path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("binwatch.db"),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file and environment.
    ///
    /// Later sources override earlier ones: defaults, `binwatch.toml` in
    /// the working directory, the file given on the command line, then
    /// `BINWATCH_` environment variables with `__` separating sections.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::file("binwatch.toml"));

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        Self::from_figment(&figment.merge(Env::prefixed("BINWATCH_").split("__")))
    }

    fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.engine
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.ingest.dedup_window == 0 {
            return Err(ConfigError::Invalid("dedup_window must be positive".to_owned()));
        }
        if self.router.queue_depth == 0 || self.router.max_concurrent_bins == 0 {
            return Err(ConfigError::Invalid(
                "queue_depth and max_concurrent_bins must be positive".to_owned(),
            ));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".to_owned()));
        }
        Ok(())
    }
}
