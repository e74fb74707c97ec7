//! Configuration for the resilience core.
//!
//! Aggregates the per-component configs into one serde-backed structure
//! that can be built in code, loaded from a TOML file, or overridden from
//! `SIS_BRIDGE_`-prefixed environment variables.

use crate::backoff::{BackoffConfig, BackoffConfigError};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dlq::DeadLetterConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid backoff configuration: {0}")]
    Backoff(#[from] BackoffConfigError),

    #[error("Invalid configuration for {component}: {reason}")]
    Invalid { component: String, reason: String },

    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Top-level configuration for the resilient execution path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// In-call retry schedule.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Circuit breaker protecting the SIS dependency.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Dead letter queue for exhausted operations.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

impl ResilienceConfig {
    /// Validate every component configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;

        self.circuit_breaker
            .validate()
            .map_err(|reason| ConfigError::Invalid {
                component: "circuit_breaker".to_string(),
                reason,
            })?;

        self.dead_letter
            .validate()
            .map_err(|reason| ConfigError::Invalid {
                component: "dead_letter".to_string(),
                reason,
            })?;

        Ok(())
    }

    /// Load from an optional TOML file plus `SIS_BRIDGE_`-prefixed
    /// environment overrides (e.g. `SIS_BRIDGE_BACKOFF__MAX_ATTEMPTS=5`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("SIS_BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: ResilienceConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }
}
