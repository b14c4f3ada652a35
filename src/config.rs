//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/sonaris.toml` by default)
//! 2. environment variables prefixed with `SONARIS_`
//!
//! Nested keys are separated by a double underscore, since many keys contain
//! single underscores themselves:
//!
//! ```text
//! SONARIS_APPLICATION__LOG_LEVEL=debug
//! SONARIS_RETRY__MAX_RETRIES=5
//! SONARIS_SCHEDULER__ACQUIRE_TIMEOUT=10s
//! ```
//!
//! Durations are human readable (`"250ms"`, `"5s"`, `"1h 30m"`).
//!
//! # Example
//!
//! ```no_run
//! use sonaris::config::SonarisConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SonarisConfig::load()?;
//!     println!("Application: {}", config.application.name);
//!     println!("Endpoints: {}", config.endpoints.len());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sonaris_core::EndpointDescriptor;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::driver::{ConnectionSettings, ResourceAddress};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sonaris.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SonarisConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Dispatch loop settings
    pub scheduler: SchedulerConfig,
    /// Retry and backoff defaults
    pub retry: RetryConfig,
    /// Session lease settings
    pub lease: LeaseConfig,
    /// Execution timeouts
    pub execution: ExecutionConfig,
    /// Job persistence
    pub store: StoreConfig,
    /// Instrument endpoints registered at startup
    pub endpoints: Vec<EndpointConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    /// Directory for persistent data; platform data dir when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sonaris".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            data_dir: None,
        }
    }
}

impl ApplicationConfig {
    /// `data_dir`, or `<platform data dir>/sonaris`, or `./data`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join("sonaris"))
                .unwrap_or_else(|| PathBuf::from("data"))
        })
    }
}

/// Dispatch loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the dispatch loop evaluates due jobs
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Bound on waiting for an endpoint session (`T_acquire`)
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Finished jobs older than this are purged
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            acquire_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries for jobs that do not set their own budget
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Session lease configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Added to a job's execution timeout to size its lease
    #[serde(with = "humantime_serde")]
    pub margin: Duration,
    /// How often expired leases are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Lease used for administrative sessions (identity probes)
    #[serde(with = "humantime_serde")]
    pub probe: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            margin: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            probe: Duration::from_secs(10),
        }
    }
}

/// Execution timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-command timeout when a command does not set one
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Per-attempt timeout when a job does not set one
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            job_timeout: Duration::from_secs(30),
        }
    }
}

/// Store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Volatile, lost on restart
    Memory,
    /// One JSON file per job
    #[default]
    Json,
}

/// Job persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend
    pub backend: StoreBackend,
    /// Directory for the JSON backend; `<data_dir>/jobs` when unset
    pub path: Option<PathBuf>,
}

/// Endpoint definition in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint identifier
    pub id: String,
    /// VISA resource string (e.g., "TCPIP0::192.168.1.100::INSTR")
    pub address: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Substring expected in the `*IDN?` response
    #[serde(default)]
    pub expected_idn: Option<String>,
    /// Supported SCPI header prefixes; empty means unrestricted
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Whether this endpoint is registered at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Transport parameters
    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl EndpointConfig {
    /// Descriptor registered with the session manager.
    pub fn descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor {
            id: self.id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            expected_idn: self.expected_idn.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SonarisConfig {
    /// Load configuration from `config/sonaris.toml` and environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Defaults are merged first, then the file, then `SONARIS_` environment
    /// variables. A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SONARIS_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and format are known
    /// - Intervals and timeouts are non-zero
    /// - `retry.base_delay <= retry.max_delay`
    /// - Endpoint IDs are unique and addresses parse
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        for (name, value) in [
            ("scheduler.tick_interval", self.scheduler.tick_interval),
            ("scheduler.acquire_timeout", self.scheduler.acquire_timeout),
            ("lease.margin", self.lease.margin),
            ("lease.sweep_interval", self.lease.sweep_interval),
            ("lease.probe", self.lease.probe),
            ("execution.command_timeout", self.execution.command_timeout),
            ("execution.job_timeout", self.execution.job_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }

        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Endpoint id cannot be empty".to_string(),
                ));
            }
            if !ids.insert(endpoint.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate endpoint ID: '{}'",
                    endpoint.id
                )));
            }
            if endpoint.address.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Endpoint '{}': 'address' cannot be empty",
                    endpoint.id
                )));
            }
            endpoint.address.parse::<ResourceAddress>().map_err(|e| {
                ConfigError::ValidationError(format!("Endpoint '{}': {e}", endpoint.id))
            })?;
            if endpoint.connection.read_terminator.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Endpoint '{}': read_terminator cannot be empty",
                    endpoint.id
                )));
            }
        }

        Ok(())
    }

    /// Directory for the JSON store.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.application.resolved_data_dir().join("jobs"))
    }
}
