//! End-to-end scenarios for the resilient execution path.
//!
//! Exercises the full composition: circuit breaker, classification,
//! backoff timing, and dead-lettering on exhaustion.

use async_trait::async_trait;
use sis_bridge::{
    BackoffConfig, CircuitBreakerConfig, ClientError, DeadLetterConfig, DlqResult,
    OperationContext, QueueSnapshot, QueueStore, ResilienceConfig, ResilientClient, SisApiError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

struct NullStore;

#[async_trait]
impl QueueStore for NullStore {
    async fn save(&self, _snapshot: &QueueSnapshot) -> DlqResult<()> {
        Ok(())
    }
    async fn load(&self) -> DlqResult<Option<QueueSnapshot>> {
        Ok(None)
    }
}

fn test_client(max_attempts: u32, base_delay: Duration, failure_threshold: u32) -> ResilientClient {
    let config = ResilienceConfig {
        backoff: BackoffConfig {
            base_delay,
            max_delay: Duration::from_secs(1),
            max_attempts,
            multiplier: 2.0,
            jitter: false,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
            health_failure_threshold: 3,
        },
        dead_letter: DeadLetterConfig::default(),
    };

    ResilientClient::from_config(config, Box::new(NullStore)).expect("valid config")
}

#[tokio::test]
async fn operation_failing_twice_then_succeeding_recovers_with_three_invocations() {
    let client = test_client(3, Duration::from_millis(20), 100);
    let context = OperationContext::new("sync_attendance");
    let calls = AtomicU32::new(0);

    let started = Instant::now();
    let result = client
        .execute(&context, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(SisApiError::http_status(503))
            } else {
                Ok("synced")
            }
        })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.expect("third attempt succeeds"), "synced");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Backoff waits between attempts 1->2 (20ms) and 2->3 (40ms).
    assert!(
        elapsed >= Duration::from_millis(60),
        "expected backoff waits, elapsed only {elapsed:?}"
    );
    assert!(client.dlq().is_empty(), "successful recovery never dead-letters");
}

#[tokio::test]
async fn exhausted_operation_raises_terminal_error_and_dead_letters_once() {
    let client = test_client(3, Duration::from_millis(1), 100);
    let context = OperationContext::new("sync_grades")
        .with_payload(serde_json::json!({"term": "2026-spring"}));
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = client
        .execute(&context, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SisApiError::Network {
                message: "connection refused".to_string(),
            })
        })
        .await;

    match result.unwrap_err() {
        ClientError::RetriesExhausted {
            attempts,
            classification,
        } => {
            assert_eq!(attempts, 3);
            assert!(classification.is_retryable);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = client.dlq().get_stats();
    assert_eq!(stats.total_items, 1, "exactly one dead letter entry");

    let entry = client.dlq().get_next_item().expect("entry is ready");
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.operation_id, context.operation_id);
    assert_eq!(entry.payload, serde_json::json!({"term": "2026-spring"}));
}

#[tokio::test]
async fn breaker_opening_mid_sequence_fast_fails_remaining_attempts() {
    // Threshold 2 opens the circuit during a 5-attempt budget.
    let client = test_client(5, Duration::from_millis(1), 2);
    let context = OperationContext::new("sync_roster");
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = client
        .execute(&context, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SisApiError::http_status(500))
        })
        .await;

    assert!(matches!(result, Err(ClientError::CircuitOpen { .. })));
    assert_eq!(
        calls.load(Ordering::SeqCst),
        2,
        "operation stops running once the circuit opens"
    );
    assert!(
        client.dlq().is_empty(),
        "circuit rejection is not retry exhaustion"
    );
}

#[tokio::test]
async fn server_suggested_retry_delay_overrides_backoff() {
    // Backoff would wait 200ms; the server says retry immediately.
    let client = test_client(2, Duration::from_millis(200), 100);
    let context = OperationContext::new("sync_sections");
    let calls = AtomicU32::new(0);

    let started = Instant::now();
    let result = client
        .execute(&context, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                let mut headers = HashMap::new();
                headers.insert("Retry-After".to_string(), "0".to_string());
                Err(SisApiError::Http {
                    status: 429,
                    headers,
                    body: None,
                })
            } else {
                Ok(())
            }
        })
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(
        elapsed < Duration::from_millis(150),
        "Retry-After should preempt the 200ms backoff, took {elapsed:?}"
    );
}

#[tokio::test]
async fn non_retryable_failure_surfaces_sanitized_message() {
    let client = test_client(3, Duration::from_millis(1), 100);
    let context = OperationContext::new("sync_roster");

    let result: Result<(), _> = client
        .execute(&context, || async {
            Err(SisApiError::Http {
                status: 401,
                headers: HashMap::new(),
                body: Some("token for svc-account@district.org expired".to_string()),
            })
        })
        .await;

    let err = result.unwrap_err();
    let message = err.to_string();
    assert!(!message.contains("svc-account"), "message must not leak detail");
    assert!(!message.contains('@'), "message must not leak addresses");
    assert!(matches!(err, ClientError::Permanent { .. }));
}

#[tokio::test]
async fn dead_letter_sweep_re_delivers_and_tracks_outcomes() {
    let client = test_client(2, Duration::from_millis(1), 100);

    // Exhaust one operation into the queue.
    let context = OperationContext::new("sync_attendance");
    let _ = client
        .execute::<_, _, ()>(&context, || async {
            Err(SisApiError::http_status(503))
        })
        .await;
    assert_eq!(client.dlq().get_stats().pending_items, 1);

    // Sweep succeeds on re-delivery.
    let outcome = client.process_dead_letter_queue(|_item| async { Ok(()) }).await;

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.rescheduled, 0);
    assert_eq!(client.dlq().get_stats().processed_items, 1);
    assert_eq!(client.dlq().get_stats().pending_items, 0);
}
