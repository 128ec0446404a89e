//! Configuration management for Sluice.
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! an optional file (YAML, TOML or JSON, chosen by extension), then
//! environment variables prefixed with `SLUICE_` using `__` as the section
//! separator (for example `SLUICE_BREAKER__THRESHOLD=3`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SluiceError};
use crate::ratelimit::key::DEFAULT_KEY_PREFIX;

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Path to the rate limit policy file
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    Redis,
    /// In-process store (single node only)
    Memory,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection URL for the Redis backend
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for rate limit window and burst keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Client-side timeout applied to every store command
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// The command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_command_timeout_ms() -> u64 {
    500
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Time after the last failure before a trial call is allowed
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Upper bound on a single guarded call; unset disables the bound
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            cooldown_ms: default_cooldown_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_call_timeout_ms() -> Option<u64> {
    Some(1_000)
}

/// Monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// How long per-minute buckets are kept
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,

    /// How often the cleanup task runs
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// How many minutes past the retention boundary each cleanup sweeps
    #[serde(default = "default_cleanup_sweep_minutes")]
    pub cleanup_sweep_minutes: u64,

    /// Alerts kept per limit type
    #[serde(default = "default_alert_history")]
    pub alert_history: usize,

    /// Fraction of the limit below which a denied request raises an alert
    #[serde(default = "default_high_usage_ratio")]
    pub high_usage_ratio: f64,

    /// Prefix for metric and alert keys
    #[serde(default = "default_metrics_prefix")]
    pub key_prefix: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            retention_minutes: default_retention_minutes(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            cleanup_sweep_minutes: default_cleanup_sweep_minutes(),
            alert_history: default_alert_history(),
            high_usage_ratio: default_high_usage_ratio(),
            key_prefix: default_metrics_prefix(),
        }
    }
}

impl MonitoringConfig {
    /// The cleanup interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn default_retention_minutes() -> u64 {
    60
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_cleanup_sweep_minutes() -> u64 {
    60
}

fn default_alert_history() -> usize {
    1000
}

fn default_high_usage_ratio() -> f64 {
    0.1
}

fn default_metrics_prefix() -> String {
    "rate_limit_metrics".to_string()
}

impl SluiceConfig {
    /// Load configuration from an optional file plus `SLUICE_*` environment
    /// overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SLUICE")
                .separator("__")
                .try_parsing(true),
        );

        let config: SluiceConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SluiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SluiceConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SluiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(SluiceError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.breaker.threshold == 0 {
            return Err(SluiceError::Config("breaker.threshold must be at least 1".to_string()));
        }
        if self.monitoring.retention_minutes == 0 {
            return Err(SluiceError::Config(
                "monitoring.retention_minutes must be at least 1".to_string(),
            ));
        }
        if self.monitoring.cleanup_interval_ms == 0 {
            return Err(SluiceError::Config(
                "monitoring.cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.monitoring.alert_history == 0 {
            return Err(SluiceError::Config(
                "monitoring.alert_history must be at least 1".to_string(),
            ));
        }
        let ratio = self.monitoring.high_usage_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SluiceError::Config(format!(
                "monitoring.high_usage_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
        Ok(())
    }
}
