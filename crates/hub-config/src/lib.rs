//! Message hub configuration
//!
//! Loads a TOML file into [`HubConfig`], applies `HUB_*` environment
//! overrides and validates the result. Every section has defaults, so an
//! empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

mod sections;

pub use sections::{
    ApiConfig, CircuitBreakerConfig, LifecycleConfig, PushSubscriptionConfig, QueueConfig,
    RegistryConfig, RetryConfig, RetryOverride, RouterConfig, SelectionStrategy, StoreConfig,
    TransactionConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level hub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub registry: RegistryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub router: RouterConfig,
    pub transaction: TransactionConfig,
    pub lifecycle: LifecycleConfig,
    pub api: ApiConfig,
    pub subscriptions: Vec<PushSubscriptionConfig>,
}

impl HubConfig {
    /// Load from a TOML file, then apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        info!(path = %path.display(), "Loaded hub configuration");
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env_var("HUB_DATA_DIR") {
            debug!(data_dir = %dir, "Overriding data dir from environment");
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(partition) = env_var("HUB_PARTITION") {
            self.store.partition = partition;
        }
        if let Some(bind) = env_var("HUB_API_BIND") {
            self.api.bind = bind;
        }
        if let Some(workers) = env_var("HUB_DISPATCH_WORKERS") {
            self.router.dispatch_workers = workers
                .parse()
                .map_err(|_| ConfigError::invalid("HUB_DISPATCH_WORKERS", "expected a positive integer"))?;
        }
        if let Some(fsync) = env_var("HUB_FSYNC") {
            self.store.fsync = fsync
                .parse()
                .map_err(|_| ConfigError::invalid("HUB_FSYNC", "expected true or false"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.partition.trim().is_empty() {
            return Err(ConfigError::invalid("store.partition", "must not be empty"));
        }
        if self.store.notify_capacity == 0 {
            return Err(ConfigError::invalid("store.notify_capacity", "must be at least 1"));
        }
        if self.queue.capacity_per_level == 0 {
            return Err(ConfigError::invalid("queue.capacity_per_level", "must be at least 1"));
        }
        if self.queue.aging_interval_ms == 0 {
            return Err(ConfigError::invalid("queue.aging_interval_ms", "must be positive"));
        }
        if matches!(self.queue.quota_max_dequeues, Some(0)) {
            return Err(ConfigError::invalid("queue.quota_max_dequeues", "must be at least 1 when set"));
        }
        if self.registry.unhealthy_threshold == 0 || self.registry.healthy_threshold == 0 {
            return Err(ConfigError::invalid("registry", "health thresholds must be at least 1"));
        }
        if self.registry.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("registry.heartbeat_interval_ms", "must be positive"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("circuit_breaker.backoff_multiplier", "must be >= 1.0"));
        }
        if self.circuit_breaker.max_reset_timeout_ms < self.circuit_breaker.reset_timeout_ms {
            return Err(ConfigError::invalid(
                "circuit_breaker.max_reset_timeout_ms",
                "must not be below reset_timeout_ms",
            ));
        }
        // Above 1/3 consecutive jittered delays may stop increasing
        if !(0.0..(1.0 / 3.0)).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::invalid("retry.jitter_fraction", "must be in [0, 1/3)"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms == 0 || self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must be positive and not above max_delay_ms",
            ));
        }
        for (message_type, over) in &self.retry.per_type {
            if matches!(over.max_attempts, Some(0)) {
                return Err(ConfigError::invalid(
                    format!("retry.per_type.{}.max_attempts", message_type),
                    "must be at least 1",
                ));
            }
        }
        if self.router.dispatch_workers == 0 {
            return Err(ConfigError::invalid("router.dispatch_workers", "must be at least 1"));
        }
        for sub in &self.subscriptions {
            if sub.service.trim().is_empty() || sub.patterns.is_empty() {
                return Err(ConfigError::invalid(
                    "subscriptions",
                    "each subscription needs a service and at least one pattern",
                ));
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = HubConfig::from_toml_str("").unwrap();
        assert_eq!(config, HubConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.registry.default_strategy, SelectionStrategy::HealthAware);
    }

    #[test]
    fn test_parse_sections() {
        let raw = r#"
            [store]
            data_dir = "/var/lib/hub"
            partition = "events"

            [retry]
            base_delay_ms = 500
            max_attempts = 7

            [retry.per_type."image.render"]
            max_attempts = 3

            [registry]
            default_strategy = "round_robin"

            [[subscriptions]]
            service = "campaign-service"
            patterns = ["character.*"]
        "#;

        let config = HubConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.store.log_path(), PathBuf::from("/var/lib/hub/events.wal"));
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.per_type["image.render"].max_attempts, Some(3));
        assert_eq!(config.registry.default_strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.subscriptions.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_large_jitter() {
        let mut config = HubConfig::default();
        config.retry.jitter_fraction = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jitter_fraction"));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let mut config = HubConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.registry.healthy_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router]\ndispatch_workers = 2").unwrap();

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.router.dispatch_workers, 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = HubConfig::load("/nonexistent/hub.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
