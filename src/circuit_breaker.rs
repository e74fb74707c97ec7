//! Circuit breaker for the SIS API dependency.
//!
//! Classic three-state machine: Closed (normal operation), Open (failing
//! fast), Half-Open (testing recovery with a bounded number of probes).
//! All transitions happen under a single mutex so concurrent callers can
//! never over-admit probes or double-count a threshold crossing. The
//! Open -> Half-Open transition is evaluated lazily on next access rather
//! than by an idle timer.
//!
//! Every transition is recorded with a timestamp and reason, and call
//! outcomes feed a bounded ring of records that backs windowed statistics
//! queries for external monitoring.

use crate::clock::{system_clock, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on retained state-change history entries.
const MAX_HISTORY_ENTRIES: usize = 128;

/// Upper bound on retained per-call records for statistics.
const MAX_CALL_RECORDS: usize = 1024;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls rejected without executing.
    Open,
    /// Testing recovery, limited probe calls allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why a state transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeReason {
    FailureThresholdExceeded,
    RecoveryTimeoutElapsed,
    ProbeFailed,
    ProbesSucceeded,
    HealthCheckFailed,
    ForcedOpen,
    ForcedClosed,
}

/// A recorded state transition, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: StateChangeReason,
}

/// Receives state-change notifications.
///
/// Injected at construction; replaces any global event bus. Callbacks run
/// outside the breaker's lock, so observers may call back into the breaker.
pub trait StateChangeObserver: Send + Sync {
    fn on_state_change(&self, change: &StateChange);
}

/// Caller-supplied readiness check (e.g. ping the SIS endpoint).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening.
    pub failure_threshold: u32,
    /// Time to wait in Open before probing recovery.
    pub recovery_timeout: Duration,
    /// Probe executions permitted in Half-Open; reaching this many
    /// successes closes the circuit.
    pub half_open_max_requests: u32,
    /// Consecutive health-probe failures before forcing Open.
    pub health_failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
            health_failure_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Preset tuned for the external SIS API.
    pub fn for_sis_api() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(45),
            half_open_max_requests: 2,
            health_failure_threshold: 3,
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }

        if self.half_open_max_requests == 0 {
            return Err("half_open_max_requests must be greater than 0".to_string());
        }

        if self.health_failure_threshold == 0 {
            return Err("health_failure_threshold must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Errors produced by circuit breaker execution.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was never invoked.
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Half-open probe quota is already consumed; the operation was never invoked.
    #[error("Circuit breaker half-open probe limit reached for {component}")]
    HalfOpenExhausted { component: String },

    /// The operation ran and failed; the failure was recorded.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    /// True when the breaker rejected the call without running it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CircuitBreakerError::CircuitOpen { .. } | CircuitBreakerError::HalfOpenExhausted { .. }
        )
    }
}

/// Statistics snapshot, optionally restricted to a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls rejected without executing (lifetime, not windowed).
    pub rejected_count: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_duration: Duration,
    pub current_state: CircuitState,
}

/// Mutable state guarded by a single lock.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_admitted: u32,
    half_open_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    consecutive_health_failures: u32,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_admitted: 0,
            half_open_successes: 0,
            opened_at: None,
            consecutive_health_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: DateTime<Utc>,
    success: bool,
    duration: Duration,
}

enum Admission {
    Allowed,
    RejectedOpen,
    RejectedHalfOpen,
}

/// Circuit breaker protecting calls to the SIS API.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    history: Mutex<Vec<StateChange>>,
    calls: Mutex<VecDeque<CallRecord>>,
    rejected_count: AtomicU64,
    clock: SharedClock,
    observer: RwLock<Option<Arc<dyn StateChangeObserver>>>,
    health_probe: RwLock<Option<Arc<dyn HealthProbe>>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs(),
            half_open_max_requests = config.half_open_max_requests,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::new()),
            history: Mutex::new(Vec::new()),
            calls: Mutex::new(VecDeque::with_capacity(MAX_CALL_RECORDS)),
            rejected_count: AtomicU64::new(0),
            clock: system_clock(),
            observer: RwLock::new(None),
            health_probe: RwLock::new(None),
        }
    }

    /// Replace the clock, for deterministic recovery-timeout tests.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Install a state-change observer.
    pub fn set_observer(&self, observer: Arc<dyn StateChangeObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Register the health probe invoked by `perform_health_check` and the
    /// background monitor.
    pub fn register_health_check(&self, probe: Arc<dyn HealthProbe>) {
        *self.health_probe.write() = Some(probe);
    }

    /// Component name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current circuit state.
    ///
    /// Reading the state also performs the lazy Open -> Half-Open transition
    /// once the recovery timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let change = {
            let mut inner = self.inner.lock();
            self.maybe_enter_half_open(&mut inner)
        };
        self.publish(change);
        self.inner.lock().state
    }

    /// Current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Execute an operation under circuit breaker protection.
    ///
    /// While Open the operation is never invoked; the call fails fast with
    /// `CircuitOpen`. In Half-Open, calls beyond the probe quota fail fast
    /// with `HalfOpenExhausted`.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.admit() {
            Admission::Allowed => {}
            Admission::RejectedOpen => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                debug!(component = %self.name, "Rejecting call: circuit open");
                return Err(CircuitBreakerError::CircuitOpen {
                    component: self.name.clone(),
                });
            }
            Admission::RejectedHalfOpen => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                debug!(component = %self.name, "Rejecting call: half-open probe quota reached");
                return Err(CircuitBreakerError::HalfOpenExhausted {
                    component: self.name.clone(),
                });
            }
        }

        let started = Instant::now();
        let result = operation().await;
        let duration = started.elapsed();

        match &result {
            Ok(_) => self.record_success(duration),
            Err(_) => self.record_failure(duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Execute an operation, falling back when the primary path is
    /// unavailable (Open / probe quota) or fails outright.
    ///
    /// The fallback's own failure propagates to the caller. Fallback
    /// execution is not counted against the breaker.
    pub async fn call_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        match self.call(operation).await {
            Ok(value) => Ok(value),
            Err(primary_err) => {
                debug!(
                    component = %self.name,
                    rejected = primary_err.is_rejection(),
                    "Primary path unavailable, invoking fallback"
                );
                fallback()
                    .await
                    .map_err(CircuitBreakerError::OperationFailed)
            }
        }
    }

    /// Run the registered health probe once and update breaker state.
    ///
    /// Returns the probe outcome; `true` when no probe is registered.
    /// Repeated failures (`health_failure_threshold` consecutive) force the
    /// circuit open independent of request-driven counting.
    pub async fn perform_health_check(&self) -> bool {
        let probe = self.health_probe.read().clone();
        let Some(probe) = probe else {
            return true;
        };

        let healthy = probe.check().await;

        let change = {
            let mut inner = self.inner.lock();
            if healthy {
                inner.consecutive_health_failures = 0;
                None
            } else {
                inner.consecutive_health_failures += 1;
                if inner.consecutive_health_failures >= self.config.health_failure_threshold
                    && inner.state != CircuitState::Open
                {
                    warn!(
                        component = %self.name,
                        consecutive_failures = inner.consecutive_health_failures,
                        "Health check failures exceeded threshold, forcing circuit open"
                    );
                    Some(self.transition(&mut inner, CircuitState::Open, StateChangeReason::HealthCheckFailed))
                } else {
                    None
                }
            }
        };
        self.publish(change);

        healthy
    }

    /// Spawn a background task that runs the health probe on an interval.
    ///
    /// Probing never blocks caller-issued `call`s; it only touches shared
    /// state under the same lock discipline.
    pub fn spawn_health_monitor(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let breaker = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so the monitor waits a
            // full interval before the first probe.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let healthy = breaker.perform_health_check().await;
                debug!(component = %breaker.name, healthy, "Scheduled health check completed");
            }
        })
    }

    /// Force the circuit open (emergency stop).
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let change = {
            let mut inner = self.inner.lock();
            (inner.state != CircuitState::Open)
                .then(|| self.transition(&mut inner, CircuitState::Open, StateChangeReason::ForcedOpen))
        };
        self.publish(change);
    }

    /// Force the circuit closed (emergency recovery).
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let change = {
            let mut inner = self.inner.lock();
            (inner.state != CircuitState::Closed)
                .then(|| self.transition(&mut inner, CircuitState::Closed, StateChangeReason::ForcedClosed))
        };
        self.publish(change);
    }

    /// Recorded state transitions, oldest first.
    pub fn history(&self) -> Vec<StateChange> {
        self.history.lock().clone()
    }

    /// Lifetime statistics snapshot.
    pub fn stats(&self) -> CircuitBreakerStats {
        self.stats_since(None)
    }

    /// Statistics over the trailing window.
    ///
    /// A window too large to subtract from the current time degrades to the
    /// lifetime snapshot.
    pub fn stats_for_window(&self, window: Duration) -> CircuitBreakerStats {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window));
        self.stats_since(cutoff)
    }

    fn stats_since(&self, cutoff: Option<DateTime<Utc>>) -> CircuitBreakerStats {
        let calls = self.calls.lock();
        let relevant: Vec<&CallRecord> = calls
            .iter()
            .filter(|record| cutoff.map_or(true, |cutoff| record.at >= cutoff))
            .collect();

        let total_calls = relevant.len() as u64;
        let success_count = relevant.iter().filter(|r| r.success).count() as u64;
        let failure_count = total_calls - success_count;

        let (success_rate, failure_rate, average_duration) = if total_calls > 0 {
            let total_duration: Duration = relevant.iter().map(|r| r.duration).sum();
            (
                success_count as f64 / total_calls as f64,
                failure_count as f64 / total_calls as f64,
                total_duration / total_calls as u32,
            )
        } else {
            (0.0, 0.0, Duration::ZERO)
        };

        drop(calls);

        CircuitBreakerStats {
            total_calls,
            success_count,
            failure_count,
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            success_rate,
            failure_rate,
            average_duration,
            current_state: self.inner.lock().state,
        }
    }

    /// Decide whether a call may proceed, performing the lazy Open ->
    /// Half-Open transition and claiming a probe slot when applicable.
    fn admit(&self) -> Admission {
        let (admission, change) = {
            let mut inner = self.inner.lock();
            let change = self.maybe_enter_half_open(&mut inner);

            let admission = match inner.state {
                CircuitState::Closed => Admission::Allowed,
                CircuitState::Open => Admission::RejectedOpen,
                CircuitState::HalfOpen => {
                    if inner.half_open_admitted < self.config.half_open_max_requests {
                        inner.half_open_admitted += 1;
                        Admission::Allowed
                    } else {
                        Admission::RejectedHalfOpen
                    }
                }
            };
            (admission, change)
        };
        self.publish(change);
        admission
    }

    /// While Open, move to Half-Open once the recovery timeout has elapsed.
    /// Caller must hold the state lock.
    fn maybe_enter_half_open(&self, inner: &mut BreakerInner) -> Option<StateChange> {
        if inner.state != CircuitState::Open {
            return None;
        }

        let opened_at = inner.opened_at?;
        let elapsed = self.clock.now().signed_duration_since(opened_at);
        let timeout = chrono::Duration::from_std(self.config.recovery_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        if elapsed >= timeout {
            Some(self.transition(
                inner,
                CircuitState::HalfOpen,
                StateChangeReason::RecoveryTimeoutElapsed,
            ))
        } else {
            None
        }
    }

    fn record_success(&self, duration: Duration) {
        self.push_call_record(true, duration);

        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_requests {
                        Some(self.transition(
                            &mut inner,
                            CircuitState::Closed,
                            StateChangeReason::ProbesSucceeded,
                        ))
                    } else {
                        debug!(
                            component = %self.name,
                            successes = inner.half_open_successes,
                            needed = self.config.half_open_max_requests,
                            "Half-open probe succeeded"
                        );
                        None
                    }
                }
                CircuitState::Open => {
                    // A call admitted before the circuit opened finished late.
                    warn!(component = %self.name, "Success recorded while circuit is open");
                    None
                }
            }
        };
        self.publish(change);
    }

    fn record_failure(&self, duration: Duration) {
        self.push_call_record(false, duration);

        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        Some(self.transition(
                            &mut inner,
                            CircuitState::Open,
                            StateChangeReason::FailureThresholdExceeded,
                        ))
                    } else {
                        debug!(
                            component = %self.name,
                            failures = inner.failure_count,
                            threshold = self.config.failure_threshold,
                            "Recorded operation failure"
                        );
                        None
                    }
                }
                CircuitState::HalfOpen => Some(self.transition(
                    &mut inner,
                    CircuitState::Open,
                    StateChangeReason::ProbeFailed,
                )),
                CircuitState::Open => None,
            }
        };
        self.publish(change);
    }

    /// Apply a state transition. Caller must hold the state lock.
    fn transition(
        &self,
        inner: &mut BreakerInner,
        to: CircuitState,
        reason: StateChangeReason,
    ) -> StateChange {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(self.clock.now());
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
                inner.opened_at = None;
            }
        }

        StateChange {
            from,
            to,
            at: self.clock.now(),
            reason,
        }
    }

    /// Record history and notify the observer, outside the state lock.
    fn publish(&self, change: Option<StateChange>) {
        let Some(change) = change else { return };

        info!(
            component = %self.name,
            from = %change.from,
            to = %change.to,
            reason = ?change.reason,
            "Circuit breaker state change"
        );

        {
            let mut history = self.history.lock();
            if history.len() >= MAX_HISTORY_ENTRIES {
                history.remove(0);
            }
            history.push(change.clone());
        }

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_state_change(&change);
        }
    }

    fn push_call_record(&self, success: bool, duration: Duration) {
        let mut calls = self.calls.lock();
        if calls.len() >= MAX_CALL_RECORDS {
            calls.pop_front();
        }
        calls.push_back(CallRecord {
            at: self.clock.now(),
            success,
            duration,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicU32;

    fn test_config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
            health_failure_threshold: 3,
        }
    }

    fn breaker_with_manual_clock(
        config: CircuitBreakerConfig,
    ) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker =
            Arc::new(CircuitBreaker::new("sis_api", config).with_clock(clock.clone()));
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(|| async { Err::<(), _>("boom".to_string()) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let result = breaker.call(|| async { Ok::<_, String>("ok") }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_calls() {
        let breaker = CircuitBreaker::new("test", test_config(3));
        assert_eq!(breaker.state(), CircuitState::Closed);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test]
    async fn test_opens_exactly_at_failure_threshold() {
        let breaker = CircuitBreaker::new("test", test_config(5));

        for i in 1..5 {
            fail(&breaker).await;
            assert_eq!(
                breaker.state(),
                CircuitState::Closed,
                "circuit should stay closed at {i} failures"
            );
        }

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let history = breaker.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, CircuitState::Closed);
        assert_eq!(history[0].to, CircuitState::Open);
        assert_eq!(history[0].reason, StateChangeReason::FailureThresholdExceeded);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", test_config(3));

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await;
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("test", test_config(1));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().rejected_count, 1);
    }

    #[tokio::test]
    async fn test_transitions_to_half_open_after_recovery_timeout() {
        let (breaker, clock) = breaker_with_manual_clock(test_config(1));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let history = breaker.history();
        assert_eq!(history.last().map(|c| c.reason), Some(StateChangeReason::RecoveryTimeoutElapsed));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker_with_manual_clock(test_config(1));
        fail(&breaker).await;
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.history().last().map(|c| c.reason),
            Some(StateChangeReason::ProbeFailed)
        );
    }

    #[tokio::test]
    async fn test_half_open_successes_close_with_counters_reset() {
        let (breaker, clock) = breaker_with_manual_clock(test_config(1));
        fail(&breaker).await;
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(
            breaker.history().last().map(|c| c.reason),
            Some(StateChangeReason::ProbesSucceeded)
        );
    }

    #[tokio::test]
    async fn test_half_open_probe_quota_rejects_concurrent_overflow() {
        let (breaker, clock) = breaker_with_manual_clock(CircuitBreakerConfig {
            half_open_max_requests: 1,
            ..test_config(1)
        });
        fail(&breaker).await;
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let slow_probe = breaker.call(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(())
        });
        let overflow = breaker.call(|| async { Ok::<_, String>(()) });

        let (first, second) = tokio::join!(slow_probe, overflow);
        let rejections = [&first, &second]
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(CircuitBreakerError::HalfOpenExhausted { .. })
                )
            })
            .count();
        assert_eq!(rejections, 1, "exactly one call should exceed the probe quota");
    }

    #[tokio::test]
    async fn test_fallback_used_when_open_and_propagates_own_failure() {
        let breaker = CircuitBreaker::new("test", test_config(1));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker
            .call_with_fallback(
                || async { Ok::<_, String>("primary") },
                || async { Ok::<_, String>("fallback") },
            )
            .await;
        assert!(matches!(result, Ok("fallback")));

        let result = breaker
            .call_with_fallback(
                || async { Ok::<_, String>("primary") },
                || async { Err::<&str, _>("fallback also down".to_string()) },
            )
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::OperationFailed(ref e)) if e == "fallback also down"
        ));
    }

    #[tokio::test]
    async fn test_fallback_used_when_operation_fails_while_closed() {
        let breaker = CircuitBreaker::new("test", test_config(5));

        let result = breaker
            .call_with_fallback(
                || async { Err::<&str, _>("primary down".to_string()) },
                || async { Ok::<_, String>("fallback") },
            )
            .await;

        assert!(matches!(result, Ok("fallback")));
        // Primary failure still counted
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_observer_receives_transitions() {
        struct Recorder(Mutex<Vec<StateChange>>);
        impl StateChangeObserver for Recorder {
            fn on_state_change(&self, change: &StateChange) {
                self.0.lock().push(change.clone());
            }
        }

        let breaker = CircuitBreaker::new("test", test_config(1));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        breaker.set_observer(recorder.clone());

        fail(&breaker).await;

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].to, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_health_check_failures_force_open() {
        struct FailingProbe;
        #[async_trait]
        impl HealthProbe for FailingProbe {
            async fn check(&self) -> bool {
                false
            }
        }

        let breaker = CircuitBreaker::new("test", test_config(5));
        breaker.register_health_check(Arc::new(FailingProbe));

        assert!(!breaker.perform_health_check().await);
        assert!(!breaker.perform_health_check().await);
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(!breaker.perform_health_check().await);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.history().last().map(|c| c.reason),
            Some(StateChangeReason::HealthCheckFailed)
        );
    }

    #[tokio::test]
    async fn test_health_monitor_forces_open_on_interval() {
        struct FailingProbe;
        #[async_trait]
        impl HealthProbe for FailingProbe {
            async fn check(&self) -> bool {
                false
            }
        }

        let breaker = Arc::new(CircuitBreaker::new("test", test_config(5)));
        breaker.register_health_check(Arc::new(FailingProbe));
        let monitor = breaker
            .clone()
            .spawn_health_monitor(Duration::from_millis(10));

        // Three probe failures (threshold) land well within this window.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.history().last().map(|c| c.reason),
            Some(StateChangeReason::HealthCheckFailed)
        );
        monitor.abort();
    }

    #[tokio::test]
    async fn test_health_check_without_probe_reports_healthy() {
        let breaker = CircuitBreaker::new("test", test_config(5));
        assert!(breaker.perform_health_check().await);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let breaker = CircuitBreaker::new("test", test_config(5));

        breaker.force_open();
        assert_eq!(breaker.inner.lock().state, CircuitState::Open);

        breaker.force_closed();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let reasons: Vec<StateChangeReason> =
            breaker.history().iter().map(|c| c.reason).collect();
        assert_eq!(
            reasons,
            vec![StateChangeReason::ForcedOpen, StateChangeReason::ForcedClosed]
        );
    }

    #[tokio::test]
    async fn test_windowed_stats_exclude_old_calls() {
        let (breaker, clock) = breaker_with_manual_clock(test_config(10));

        fail(&breaker).await;
        succeed(&breaker).await;

        clock.advance(chrono::Duration::seconds(120));
        succeed(&breaker).await;

        let lifetime = breaker.stats();
        assert_eq!(lifetime.total_calls, 3);
        assert_eq!(lifetime.failure_count, 1);

        let recent = breaker.stats_for_window(Duration::from_secs(60));
        assert_eq!(recent.total_calls, 1);
        assert_eq!(recent.failure_count, 0);
        assert_eq!(recent.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::for_sis_api().validate().is_ok());

        let invalid = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(invalid.validate().is_err());

        let invalid = CircuitBreakerConfig {
            recovery_timeout: Duration::ZERO,
            ..CircuitBreakerConfig::default()
        };
        assert!(invalid.validate().is_err());

        let invalid = CircuitBreakerConfig {
            half_open_max_requests: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(invalid.validate().is_err());
    }
}
