//! Resilient execution path for outbound SIS API operations.
//!
//! Composition root: executes a caller-supplied async operation through the
//! circuit breaker, classifies failures, retries transient ones on the
//! backoff schedule, and dead-letters operations whose in-call budget is
//! exhausted. A separate sweep entry point re-delivers dead letters on the
//! queue's own schedule.

use crate::backoff::ExponentialBackoff;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::classifier::{redact, ErrorClassification, ErrorClassifier, StandardErrorClassifier};
use crate::config::{ConfigError, ResilienceConfig};
use crate::dlq::{DeadLetterQueue, FailedOperation, OperationStatus, QueueStore};
use crate::errors::SisApiError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Caller-supplied context describing one outbound operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Unique id carried into any dead letter record.
    pub operation_id: String,
    /// Caller-meaningful operation kind (e.g. "sync_attendance").
    pub operation_type: String,
    /// Opaque payload needed to re-execute the operation later.
    pub payload: serde_json::Value,
    /// Per-attempt deadline; expiry counts as a timeout failure.
    pub timeout: Option<Duration>,
    /// Also dead-letter permanent (non-retryable) failures, for audit.
    pub persist_permanent_failures: bool,
}

impl OperationContext {
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            payload: serde_json::Value::Null,
            timeout: None,
            persist_permanent_failures: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn persist_permanent_failures(mut self) -> Self {
        self.persist_permanent_failures = true;
        self
    }
}

/// Terminal failures surfaced to callers of [`ResilientClient::execute`].
///
/// The three conditions are deliberately distinguishable: dependency
/// unavailable (try again shortly), permanent (fix the input), and
/// exhausted (recovered later via the dead letter queue).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The circuit breaker rejected the call without invoking the operation.
    #[error("Service temporarily unavailable: circuit is open for {component}")]
    CircuitOpen { component: String },

    /// The failure is permanent; retries cannot fix it.
    #[error("{}", .classification.user_message)]
    Permanent { classification: ErrorClassification },

    /// Every in-call attempt failed; a dead letter record was created.
    #[error("Max retry attempts exceeded after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        classification: ErrorClassification,
    },
}

impl ClientError {
    /// Classification of the underlying failure, when one exists.
    pub fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            ClientError::CircuitOpen { .. } => None,
            ClientError::Permanent { classification }
            | ClientError::RetriesExhausted { classification, .. } => Some(classification),
        }
    }
}

/// Report from one dead letter queue sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// Items re-delivered successfully.
    pub processed: usize,
    /// Items that failed again and were rescheduled.
    pub rescheduled: usize,
    /// Items that failed again and exhausted their queue retry budget.
    pub permanently_failed: usize,
}

/// Resilient client composing the breaker, classifier, backoff, and DLQ.
///
/// All collaborators are injected explicitly; there is no process-wide
/// shared instance.
pub struct ResilientClient {
    breaker: Arc<CircuitBreaker>,
    classifier: Arc<dyn ErrorClassifier>,
    backoff: ExponentialBackoff,
    dlq: Arc<DeadLetterQueue>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("breaker", &self.breaker.name())
            .field("classifier", &self.classifier.classifier_name())
            .field("max_attempts", &self.backoff.config().max_attempts)
            .finish()
    }
}

impl ResilientClient {
    /// Compose a client from explicitly constructed collaborators.
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        classifier: Arc<dyn ErrorClassifier>,
        backoff: ExponentialBackoff,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            breaker,
            classifier,
            backoff,
            dlq,
        }
    }

    /// Build a client with standard collaborators from configuration.
    pub fn from_config(
        config: ResilienceConfig,
        store: Box<dyn QueueStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new("sis_api", config.circuit_breaker));
        let backoff = ExponentialBackoff::new(config.backoff)?;
        let dlq = Arc::new(DeadLetterQueue::new(config.dead_letter, store)?);

        Ok(Self::new(
            breaker,
            Arc::new(StandardErrorClassifier::new()),
            backoff,
            dlq,
        ))
    }

    /// The circuit breaker protecting this client's calls.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The dead letter queue receiving exhausted operations.
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Execute an operation through the full resilience path.
    ///
    /// The operation is a factory so each retry gets a fresh future. Every
    /// attempt passes back through the circuit breaker, so a breaker that
    /// opens mid-sequence fast-fails the remaining attempts. Circuit
    /// rejections do not consume a retry attempt.
    pub async fn execute<F, Fut, T>(
        &self,
        context: &OperationContext,
        operation: F,
    ) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SisApiError>>,
    {
        let max_attempts = self.backoff.config().max_attempts;
        let mut attempt: u32 = 1;

        loop {
            let outcome = self
                .breaker
                .call(|| Self::run_attempt(&operation, context.timeout))
                .await;

            let api_error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation_id = %context.operation_id,
                            operation_type = %context.operation_type,
                            attempt,
                            "Operation recovered after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(CircuitBreakerError::CircuitOpen { component })
                | Err(CircuitBreakerError::HalfOpenExhausted { component }) => {
                    warn!(
                        operation_id = %context.operation_id,
                        operation_type = %context.operation_type,
                        attempt,
                        "Call rejected by circuit breaker"
                    );
                    return Err(ClientError::CircuitOpen { component });
                }
                Err(CircuitBreakerError::OperationFailed(api_error)) => api_error,
            };

            let classification = self.classifier.classify(&api_error);
            debug!(
                operation_id = %context.operation_id,
                attempt,
                error_type = %classification.error_type,
                raw_error = %redact(&api_error.to_string()),
                "Operation attempt failed"
            );

            if !classification.is_retryable {
                if context.persist_permanent_failures {
                    self.enqueue_dead_letter(context, classification.clone(), attempt);
                }
                return Err(ClientError::Permanent { classification });
            }

            if !self.backoff.should_retry(attempt + 1) {
                error!(
                    operation_id = %context.operation_id,
                    operation_type = %context.operation_type,
                    attempts = max_attempts,
                    error_type = %classification.error_type,
                    "Retry attempts exhausted, dead-lettering operation"
                );
                self.enqueue_dead_letter(context, classification.clone(), max_attempts);
                return Err(ClientError::RetriesExhausted {
                    attempts: max_attempts,
                    classification,
                });
            }

            // Server-suggested delay (Retry-After) wins over the backoff curve.
            let delay = classification
                .retry_delay
                .unwrap_or_else(|| self.backoff.calculate_delay(attempt));
            debug!(
                operation_id = %context.operation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting before retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn run_attempt<F, Fut, T>(
        operation: &F,
        timeout: Option<Duration>,
    ) -> Result<T, SisApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SisApiError>>,
    {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(SisApiError::Timeout {
                    message: "operation exceeded caller deadline".to_string(),
                    timeout: limit,
                }),
            },
            None => operation().await,
        }
    }

    fn enqueue_dead_letter(
        &self,
        context: &OperationContext,
        classification: ErrorClassification,
        retry_count: u32,
    ) {
        let item = FailedOperation {
            operation_id: context.operation_id.clone(),
            operation_type: context.operation_type.clone(),
            error: classification,
            failed_at: chrono::Utc::now(),
            retry_count,
            next_retry_at: None,
            payload: context.payload.clone(),
            processed_at: None,
        };

        if let Err(e) = self.dlq.add(item) {
            // Exhaustion still surfaces to the caller; losing the dead
            // letter record is logged loudly instead of masking the error.
            error!(
                operation_id = %context.operation_id,
                error = %e,
                "Failed to dead-letter exhausted operation"
            );
        }
    }

    /// Re-deliver dead letters until no item is ready.
    ///
    /// Independent of the in-call retry loop: the queue owns its own
    /// retry/backoff schedule. Each claimed item is handed to `handler`;
    /// success marks it processed, failure bumps its retry count (which may
    /// tip it into permanent failure).
    pub async fn process_dead_letter_queue<F, Fut>(&self, handler: F) -> SweepOutcome
    where
        F: Fn(FailedOperation) -> Fut,
        Fut: Future<Output = Result<(), SisApiError>>,
    {
        let mut outcome = SweepOutcome::default();
        let max_retries = self.dlq.config().max_retries;

        while let Some(item) = self.dlq.get_next_item() {
            let operation_id = item.operation_id.clone();
            let operation_type = item.operation_type.clone();

            match handler(item).await {
                Ok(()) => match self.dlq.mark_as_processed(&operation_id) {
                    Ok(()) => {
                        info!(
                            operation_id = %operation_id,
                            operation_type = %operation_type,
                            "Dead letter re-delivered"
                        );
                        outcome.processed += 1;
                    }
                    Err(e) => {
                        warn!(operation_id = %operation_id, error = %e, "Could not mark dead letter processed");
                    }
                },
                Err(api_error) => {
                    debug!(
                        operation_id = %operation_id,
                        raw_error = %redact(&api_error.to_string()),
                        "Dead letter re-delivery failed"
                    );
                    match self.dlq.increment_retry_count(&operation_id) {
                        Ok(updated) => {
                            if updated.status(max_retries) == OperationStatus::PermanentlyFailed {
                                outcome.permanently_failed += 1;
                            } else {
                                outcome.rescheduled += 1;
                            }
                        }
                        Err(e) => {
                            warn!(operation_id = %operation_id, error = %e, "Could not reschedule dead letter");
                            self.dlq.release(&operation_id);
                        }
                    }
                }
            }
        }

        if outcome != SweepOutcome::default() {
            info!(
                processed = outcome.processed,
                rescheduled = outcome.rescheduled,
                permanently_failed = outcome.permanently_failed,
                "Dead letter sweep completed"
            );
        }
        outcome
    }
}
