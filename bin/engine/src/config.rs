//! Centralized daemon configuration.
//!
//! Composed from the library configs and loaded via the `config` crate from
//! an optional file plus environment variables, which take precedence.
//! Nested keys use `__`, e.g. `RUNTIME__WORKER_COUNT=8` or `NATS__URL`.

use crate::tms::TmsConfig;
use haulflow_events::{BusConfig, NatsConfig};
use haulflow_integration::LimitConfig;
use haulflow_workflow::RuntimeConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Daemon configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub nats: NatsConfig,

    /// Per-action concurrency limits.
    #[serde(default)]
    pub limits: LimitConfig,

    #[serde(default)]
    pub tms: TmsConfig,

    #[serde(default)]
    pub definitions: DefinitionsConfig,
}

/// Connection pool and query settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Statement timeout for `data.db_query`, in milliseconds.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_query_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// How often published definitions are re-read from the database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DefinitionsConfig {
    #[serde(default = "default_refresh_seconds")]
    pub refresh_seconds: u64,
}

fn default_refresh_seconds() -> u64 {
    30
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        Self {
            refresh_seconds: default_refresh_seconds(),
        }
    }
}

impl DefinitionsConfig {
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds.max(1))
    }
}

impl EngineConfig {
    /// Loads configuration from `file` (if given) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::build(
            file,
            config::Environment::default()
                .separator("__")
                .try_parsing(true),
        )
    }

    fn build(
        file: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder.add_source(environment).build()?.try_deserialize()
    }
}
