//! # SIS Bridge Resilience Core
//!
//! Fault-tolerance machinery for calling an unreliable external student
//! information system (SIS) API. The crate decides *whether, when, and how
//! many times* to attempt a caller-supplied operation, and what to do when
//! attempts are exhausted. It does not build requests, authenticate, or
//! render anything.
//!
//! ## Components
//!
//! - [`classifier`] - maps transport failures into a structured
//!   classification: type, retryability, severity, transient/permanent
//!   category, and a fixed PII-free user message.
//! - [`backoff`] - exponential retry delays, bounded by a maximum and
//!   optionally jittered.
//! - [`circuit_breaker`] - Closed/Open/Half-Open state machine that
//!   fast-fails while the SIS is unhealthy and recovers via timed probes.
//! - [`dlq`] - bounded, persistable dead letter queue with prioritized
//!   re-delivery and lifecycle statistics.
//! - [`client`] - the composition root wiring the above into a resilient
//!   execution path plus a background re-delivery sweep.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sis_bridge::client::{OperationContext, ResilientClient};
//! use sis_bridge::config::ResilienceConfig;
//! use sis_bridge::dlq::JsonFileStore;
//! use sis_bridge::errors::SisApiError;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ResilientClient::from_config(
//!     ResilienceConfig::default(),
//!     Box::new(JsonFileStore::new("dead_letters.json")),
//! )?;
//!
//! let context = OperationContext::new("sync_attendance")
//!     .with_timeout(std::time::Duration::from_secs(30));
//!
//! let roster = client
//!     .execute(&context, || async {
//!         // the actual HTTP call to the SIS lives here
//!         Ok::<_, SisApiError>("attendance synced")
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod client;
pub mod clock;
pub mod config;
pub mod dlq;
pub mod errors;
pub mod logging;

pub use backoff::{BackoffConfig, BackoffConfigError, ExponentialBackoff};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats, CircuitState,
    HealthProbe, StateChange, StateChangeObserver, StateChangeReason,
};
pub use classifier::{
    redact, ErrorCategory, ErrorClassification, ErrorClassifier, ErrorSeverity, ErrorType,
    StandardErrorClassifier,
};
pub use client::{ClientError, OperationContext, ResilientClient, SweepOutcome};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ResilienceConfig};
pub use dlq::{
    DeadLetterConfig, DeadLetterQueue, FailedOperation, JsonFileStore, OperationStatus,
    QueueSnapshot, QueueStats, QueueStore,
};
pub use errors::{DlqError, DlqResult, SisApiError};
