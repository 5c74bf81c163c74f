//! Integration tests for the retry executor's timing and stop conditions.

mod common;

use common::{DelayRecorder, MockError};
use db_keepalive::config::RetryConfig;
use db_keepalive::db::{ErrorClass, RetryExecutor, RetryStop};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn classify(error: &MockError) -> ErrorClass {
    if error.retryable {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

fn doubling_config() -> RetryConfig {
    RetryConfig::connection()
        .with_max_retries(3)
        .with_delays(Duration::from_secs(1), Duration::from_secs(30))
        .with_jitter(0.0)
}

#[tokio::test(start_paused = true)]
async fn test_four_attempts_with_doubling_delays() {
    let recorder = Arc::new(DelayRecorder::default());
    let executor = RetryExecutor::with_observer(recorder.clone());
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result: Result<(), _> = executor
        .execute("connect", &doubling_config(), classify, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MockError::transient("connection refused"))
        })
        .await;

    let failure = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(failure.attempts, 4);
    assert_eq!(failure.stop, RetryStop::Exhausted);
    assert_eq!(
        recorder.delays(),
        vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
            None,
        ]
    );
    assert_eq!(started.elapsed(), Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_fail_once_then_succeed() {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let value = RetryExecutor::new()
        .execute("select", &doubling_config(), classify, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MockError::transient("connection reset"))
            } else {
                Ok("row")
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "row");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_runs_exactly_once() {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result: Result<(), _> = RetryExecutor::new()
        .execute("connect", &doubling_config().with_enabled(false), classify, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MockError::transient("connection refused"))
        })
        .await;

    let failure = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(failure.stop, RetryStop::Disabled);
    assert_eq!(failure.into_inner(), MockError::transient("connection refused"));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_returns_immediately() {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result: Result<(), _> = RetryExecutor::new()
        .execute("connect", &doubling_config(), classify, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MockError::fatal("password authentication failed"))
        })
        .await;

    let failure = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(failure.stop, RetryStop::Fatal);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_jittered_delays_stay_under_cap() {
    let recorder = Arc::new(DelayRecorder::default());
    let executor = RetryExecutor::with_observer(recorder.clone());
    let config = RetryConfig::operation()
        .with_max_retries(6)
        .with_delays(Duration::from_millis(500), Duration::from_secs(2))
        .with_jitter(0.5);

    let _: Result<(), _> = executor
        .execute("select", &config, classify, || async {
            Err(MockError::transient("timeout"))
        })
        .await;

    let delays = recorder.delays();
    assert_eq!(delays.len(), 7);
    for delay in delays.into_iter().flatten() {
        assert!(delay <= Duration::from_secs(2), "{delay:?} exceeds cap");
    }
}
