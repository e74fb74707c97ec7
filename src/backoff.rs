//! Exponential backoff calculation for retry scheduling.
//!
//! Provides the delay schedule shared by the in-call retry loop and the
//! dead letter queue's re-delivery timing: geometric growth from a base
//! delay, capped at a maximum, with optional jitter to keep many callers
//! from retrying in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for exponential backoff behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to every calculated delay.
    pub max_delay: Duration,
    /// Maximum number of attempts (initial call included).
    pub max_attempts: u32,
    /// Geometric growth factor per attempt.
    pub multiplier: f64,
    /// Randomize delays into [0.5x, 1.5x) of the capped value.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Configuration violations reported at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackoffConfigError {
    #[error("base_delay must be greater than zero")]
    ZeroBaseDelay,

    #[error("max_delay {max_delay:?} must be at least base_delay {base_delay:?}")]
    MaxDelayBelowBase {
        base_delay: Duration,
        max_delay: Duration,
    },

    #[error("max_attempts must be greater than zero")]
    ZeroMaxAttempts,

    #[error("multiplier {multiplier} must be at least 1.0")]
    MultiplierBelowOne { multiplier: f64 },
}

impl BackoffConfig {
    /// Validate every parameter, reporting the first violation found.
    pub fn validate(&self) -> Result<(), BackoffConfigError> {
        if self.base_delay.is_zero() {
            return Err(BackoffConfigError::ZeroBaseDelay);
        }

        if self.max_delay < self.base_delay {
            return Err(BackoffConfigError::MaxDelayBelowBase {
                base_delay: self.base_delay,
                max_delay: self.max_delay,
            });
        }

        if self.max_attempts == 0 {
            return Err(BackoffConfigError::ZeroMaxAttempts);
        }

        if self.multiplier < 1.0 {
            return Err(BackoffConfigError::MultiplierBelowOne {
                multiplier: self.multiplier,
            });
        }

        Ok(())
    }
}

/// Exponential backoff calculator with attempt tracking.
///
/// Attempt numbers are 1-based: attempt 1 is the initial call, so the delay
/// before retrying it is `base_delay * multiplier^0`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_attempt: u32,
    started_at: Option<std::time::Instant>,
}

impl ExponentialBackoff {
    /// Build a calculator, rejecting invalid configuration eagerly.
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            current_attempt: 0,
            started_at: None,
        })
    }

    /// The configuration this calculator was built with.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay to wait after the given (1-based) attempt fails.
    ///
    /// Without jitter the result is exactly
    /// `min(max_delay, base_delay * multiplier^(attempt-1))` and fully
    /// reproducible. With jitter the capped value is scaled by a uniform
    /// draw from [0.5, 1.5).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(1_000) as i32;
        let growth = self.config.multiplier.powi(exponent);
        let max_secs = self.config.max_delay.as_secs_f64();
        // Clamp in f64 space so a huge exponent can never overflow Duration.
        let capped_secs = (self.config.base_delay.as_secs_f64() * growth).min(max_secs);

        let final_secs = if self.config.jitter {
            capped_secs * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped_secs
        };

        Duration::try_from_secs_f64(final_secs).unwrap_or(self.config.max_delay)
    }

    /// Whether the given (1-based) attempt is within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_attempts
    }

    /// Record that an attempt was made.
    pub fn record_attempt(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(std::time::Instant::now());
        }
        self.current_attempt = (self.current_attempt + 1).min(self.config.max_attempts);
    }

    /// Attempts recorded since construction or the last reset.
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Time since the first recorded attempt, if any.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|at| at.elapsed())
    }

    /// Whether the attempt budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.current_attempt >= self.config.max_attempts
    }

    /// Clear attempt tracking for reuse.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
        self.started_at = None;
    }
}
