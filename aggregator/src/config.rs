//! Aggregator configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file (`TALLY_CONFIG`, default `tally.toml`), then `TALLY_*` environment
//! variables with `__` separating nested keys
//! (`TALLY_DATABASE__MAX_SIZE=16`).

use crate::registry::instrument::{TypeConfig, DEFAULT_QUANTILES};
use crate::registry::sink::DEFAULT_SUMMARY_WINDOW;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "TALLY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "tally.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Listen address for the HTTP server
    pub listen_addr: String,

    /// Largest accepted ingest body
    pub max_body_bytes: usize,

    pub log_format: LogFormat,

    /// Static credentials. A list rather than a table: `config` lowercases
    /// table keys, and API keys are case-sensitive.
    pub api_keys: Vec<ApiKeyEntry>,

    pub registry: RegistryConfig,

    /// Optional SQLite pool; enables the infra metrics feed and key lookup
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub tenant: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub histogram_buckets: Vec<f64>,
    pub summary_quantiles: Vec<f64>,
    /// Observations kept per summary child
    pub summary_max_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_size: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// Queries slower than this count as slow
    pub slow_query_ms: u64,
    pub pool_refresh_secs: u64,
    pub health_interval_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 1024 * 1024,
            log_format: LogFormat::Text,
            api_keys: Vec::new(),
            registry: RegistryConfig::default(),
            database: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            summary_quantiles: DEFAULT_QUANTILES.to_vec(),
            summary_max_samples: DEFAULT_SUMMARY_WINDOW,
        }
    }
}

impl RegistryConfig {
    pub fn type_config(&self) -> TypeConfig {
        TypeConfig {
            histogram_buckets: self.histogram_buckets.clone(),
            summary_quantiles: self.summary_quantiles.clone(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tally.db"),
            max_size: 10,
            connection_timeout_secs: 5,
            idle_timeout_secs: 600,
            slow_query_ms: 1000,
            pool_refresh_secs: 5,
            health_interval_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }

    pub fn pool_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pool_refresh_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl AggregatorConfig {
    /// Load from `$TALLY_CONFIG` (or `tally.toml`) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// Load from `path` (optional) layered under `TALLY_*` variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("TALLY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen_addr {:?}: {}", self.listen_addr, e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max_body_bytes must be positive".into()));
        }
        if self
            .api_keys
            .iter()
            .any(|e| e.key.is_empty() || e.tenant.trim().is_empty())
        {
            return Err(ConfigError::Invalid("api_keys entries must be non-empty".into()));
        }

        let buckets = &self.registry.histogram_buckets;
        if buckets.is_empty()
            || buckets.iter().any(|b| !b.is_finite())
            || buckets.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(ConfigError::Invalid(
                "registry.histogram_buckets must be finite and strictly increasing".into(),
            ));
        }
        if self
            .registry
            .summary_quantiles
            .iter()
            .any(|q| !(0.0..=1.0).contains(q))
        {
            return Err(ConfigError::Invalid(
                "registry.summary_quantiles must lie in [0, 1]".into(),
            ));
        }
        if self.registry.summary_max_samples == 0 {
            return Err(ConfigError::Invalid(
                "registry.summary_max_samples must be positive".into(),
            ));
        }

        if let Some(db) = &self.database {
            if db.max_size == 0 {
                return Err(ConfigError::Invalid("database.max_size must be positive".into()));
            }
            if db.connection_timeout_secs == 0 || db.idle_timeout_secs == 0 {
                return Err(ConfigError::Invalid(
                    "database.connection_timeout_secs and database.idle_timeout_secs must be positive"
                        .into(),
                ));
            }
            if db.pool_refresh_secs == 0 || db.health_interval_secs == 0 {
                return Err(ConfigError::Invalid(
                    "database task intervals must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}
