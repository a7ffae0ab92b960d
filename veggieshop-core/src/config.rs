//! Configuration management using Figment
//!
//! Sources, highest precedence first:
//! 1. Environment variables (prefix `VEGGIESHOP_`, `__` as separator)
//! 2. `./veggieshop.toml`
//! 3. Default values

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abac::AbacConfig;
use crate::consistency::ConsistencyConfig;
use crate::dedupe::DedupeConfig;
use crate::events::{ConsumerConfig, OutboxConfig, ProducerConfig};
use crate::idempotency::IdempotencyConfig;
use crate::partnerauth::HmacConfig;
use crate::ratelimit::RateLimitConfig;
use crate::stepup::StepUpConfig;
use crate::tenant::TenantResolverConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// dev, staging, production
    #[serde(default = "default_environment")]
    pub environment: String,

    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_service_name() -> String {
    "veggieshop".to_string()
}
fn default_environment() -> String {
    "dev".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            environment: default_environment(),
            log_level: default_log_level(),
        }
    }
}

/// Root configuration for the platform core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub tenant_resolver: TenantResolverConfig,

    #[serde(default)]
    pub consistency: ConsistencyConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    #[serde(default)]
    pub dedupe: DedupeConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub hmac: HmacConfig,

    #[serde(default)]
    pub step_up: StepUpConfig,

    #[serde(default)]
    pub abac: AbacConfig,
}

impl PlatformConfig {
    /// Load from defaults, `./veggieshop.toml`, and `VEGGIESHOP_*` env vars
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("veggieshop.toml")
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("VEGGIESHOP_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range settings; warn on risky but legal ones
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, ratio) in [
            ("producer.jitter_ratio", self.producer.jitter_ratio),
            ("outbox.jitter_ratio", self.outbox.jitter_ratio),
            ("consumer.jitter_ratio", self.consumer.jitter_ratio),
        ] {
            if !(0.0..=0.9).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 0.9], got {ratio}"
                )));
            }
        }
        if self.producer.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "producer.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.consistency.ryw_initial_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "consistency.ryw_initial_poll_ms must be at least 1".to_string(),
            ));
        }
        if self.outbox.quarantine_threshold == 0 {
            return Err(ConfigError::Invalid(
                "outbox.quarantine_threshold must be at least 1".to_string(),
            ));
        }
        if self.step_up.min_elevation_minutes > self.step_up.max_elevation_minutes {
            return Err(ConfigError::Invalid(
                "step_up.min_elevation_minutes exceeds max_elevation_minutes".to_string(),
            ));
        }
        if self.dedupe.ttl_secs < 7 * 24 * 3600 {
            tracing::warn!(
                ttl_secs = self.dedupe.ttl_secs,
                "dedupe.ttl_secs below 7 days weakens duplicate detection"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PlatformConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.service.name, "veggieshop");
        assert_eq!(config.consistency.ryw_initial_poll_ms, 20);
        assert_eq!(config.consistency.ryw_max_poll_ms, 150);
        assert_eq!(config.consistency.ryw_max_wait_ms, 2_000);
        assert_eq!(config.outbox.quarantine_threshold, 10);
        assert_eq!(config.step_up.min_elevation_minutes, 15);
        assert_eq!(config.step_up.max_elevation_minutes, 60);
        assert_eq!(config.consumer.dlq_suffix, ".DLQ");
    }

    #[test]
    fn test_jitter_range_enforced() {
        let mut config = PlatformConfig::default();
        config.producer.jitter_ratio = 0.95;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.producer.jitter_ratio = -0.1;
        assert!(config.validate().is_err());

        config.producer.jitter_ratio = 0.9;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_elevation_bounds_enforced() {
        let mut config = PlatformConfig::default();
        config.step_up.min_elevation_minutes = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = PlatformConfig::load_from("definitely-not-present.toml").unwrap();
        assert_eq!(config.producer.max_attempts, 5);
    }

    #[test]
    fn test_toml_roundtrip() {
        // The full config serializes and re-parses, so figment layering works
        let config = PlatformConfig::default();
        let toml = toml_like_json(&config);
        let back: PlatformConfig = serde_json::from_value(toml).unwrap();
        assert_eq!(back.rate_limit.max_buckets, config.rate_limit.max_buckets);
    }

    fn toml_like_json(config: &PlatformConfig) -> serde_json::Value {
        serde_json::to_value(config).unwrap()
    }
}
