//! Circuit breaker recovery behavior over real elapsed time.
//!
//! Complements the clock-driven unit tests with short real timeouts, so the
//! lazy Open -> Half-Open transition is exercised the way production sees it.

use sis_bridge::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, SisApiError,
};
use std::time::Duration;

fn quick_breaker(failure_threshold: u32, half_open_max_requests: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "sis_api",
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_requests,
            health_failure_threshold: 3,
        },
    )
}

async fn fail(breaker: &CircuitBreaker) {
    let _ = breaker
        .call(|| async { Err::<(), _>(SisApiError::http_status(503)) })
        .await;
}

#[tokio::test]
async fn open_circuit_recovers_through_half_open_probe() {
    let breaker = quick_breaker(1, 1);

    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // Still inside the recovery window: fast-fail.
    let result = breaker
        .call(|| async { Ok::<_, SisApiError>(()) })
        .await;
    assert!(matches!(
        result,
        Err(CircuitBreakerError::CircuitOpen { .. })
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // One successful probe closes the circuit.
    let result = breaker.call(|| async { Ok::<_, SisApiError>("ok") }).await;
    assert!(result.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn failed_probe_reopens_and_recovery_waits_again() {
    let breaker = quick_breaker(1, 1);

    fail(&breaker).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Probe fails: straight back to Open.
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // The fresh Open period rejects again until its own timeout elapses.
    let result = breaker
        .call(|| async { Ok::<_, SisApiError>(()) })
        .await;
    assert!(matches!(
        result,
        Err(CircuitBreakerError::CircuitOpen { .. })
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    let result = breaker.call(|| async { Ok::<_, SisApiError>(()) }).await;
    assert!(result.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn multi_probe_recovery_requires_every_success() {
    let breaker = quick_breaker(1, 2);

    fail(&breaker).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let result = breaker.call(|| async { Ok::<_, SisApiError>(()) }).await;
    assert!(result.is_ok());
    assert_eq!(
        breaker.state(),
        CircuitState::HalfOpen,
        "one of two required probes is not enough"
    );

    let result = breaker.call(|| async { Ok::<_, SisApiError>(()) }).await;
    assert!(result.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn state_change_history_tells_the_recovery_story() {
    use sis_bridge::StateChangeReason;

    let breaker = quick_breaker(1, 1);

    fail(&breaker).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let _ = breaker.call(|| async { Ok::<_, SisApiError>(()) }).await;

    let reasons: Vec<StateChangeReason> =
        breaker.history().iter().map(|change| change.reason).collect();
    assert_eq!(
        reasons,
        vec![
            StateChangeReason::FailureThresholdExceeded,
            StateChangeReason::RecoveryTimeoutElapsed,
            StateChangeReason::ProbesSucceeded,
        ]
    );
}
