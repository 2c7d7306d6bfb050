//! Integration tests for resilience module
//!
//! Drives the circuit state machine with a mock clock the way a store would,
//! and exercises the retry executor against classified errors.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sheetgate_common::error::{ErrorClassification, ErrorSeverity};
use sheetgate_common::resilience::{
    policies, CallAdmission, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Clock,
    MockClock, RetryConfig, RetryError, RetryExecutor,
};

/// Upstream-like error for exercising the classified retry policy
#[derive(Debug, Clone, PartialEq)]
enum UpstreamFailure {
    Throttled(Option<Duration>),
    Forbidden,
}

impl ErrorClassification for UpstreamFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled(hint) => *hint,
            Self::Forbidden => None,
        }
    }
}

/// Validates the full breaker lifecycle against a shared snapshot.
///
/// Mirrors a breaker with threshold 3 and a 30s timeout: three failures open
/// it, a check ten seconds later fails fast, and a check after thirty-one
/// seconds is admitted as the single half-open trial.
///
/// # Test Steps
/// 1. Record three failures at t=0
/// 2. Check at t+10s and expect a fail-fast rejection with ~20s remaining
/// 3. Check at t+31s and expect the trial
/// 4. Record the trial success and expect CLOSED
#[test]
fn test_breaker_lifecycle_with_mock_clock() {
    let clock = MockClock::at_millis(1_700_000_000_000);
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .timeout(Duration::from_secs(30))
        .build()
        .expect("valid config");
    let snapshot = Mutex::new(CircuitSnapshot::default());

    for _ in 0..3 {
        let mut state = snapshot.lock();
        assert!(state.try_acquire(clock.millis_since_epoch(), &config).is_granted());
        state.on_failure(clock.millis_since_epoch(), false, &config);
    }
    assert_eq!(snapshot.lock().state, CircuitState::Open);

    clock.advance(Duration::from_secs(10));
    let admission = snapshot.lock().try_acquire(clock.millis_since_epoch(), &config);
    assert_eq!(
        admission,
        CallAdmission::Rejected { state: CircuitState::Open, retry_after: Duration::from_secs(20) }
    );

    clock.advance(Duration::from_secs(21));
    let admission = snapshot.lock().try_acquire(clock.millis_since_epoch(), &config);
    assert_eq!(admission, CallAdmission::Granted { trial: true });

    snapshot.lock().on_success(true);
    assert_eq!(snapshot.lock().state, CircuitState::Closed);
}

/// Validates that concurrent acquirers racing on a half-open circuit get
/// exactly one trial.
///
/// # Test Steps
/// 1. Open the circuit and let the timeout elapse
/// 2. Race 16 threads through `try_acquire` under one lock
/// 3. Count granted trials
#[test]
fn test_half_open_trial_is_exclusive_under_contention() {
    let config =
        CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config");
    let snapshot = Arc::new(Mutex::new(CircuitSnapshot::default()));
    snapshot.lock().on_failure(0, false, &config);

    let granted = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let snapshot = Arc::clone(&snapshot);
            let granted = Arc::clone(&granted);
            let config = config.clone();
            std::thread::spawn(move || {
                if snapshot.lock().try_acquire(60_000, &config).is_granted() {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    assert_eq!(granted.load(Ordering::SeqCst), 1);
}

/// Validates that the classified policy retries throttling and honours the
/// server delay hint.
///
/// # Test Steps
/// 1. Fail twice with a throttling error carrying a 5ms hint
/// 2. Succeed on the third attempt
/// 3. Confirm three attempts were made
#[tokio::test]
async fn test_classified_retry_honours_hint() {
    let attempts = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::builder().max_attempts(4).no_jitter().build().expect("valid config");
    let executor = RetryExecutor::new(config, policies::ClassifiedRetry);

    let counter = Arc::clone(&attempts);
    let result = executor
        .execute(|_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(UpstreamFailure::Throttled(Some(Duration::from_millis(5))))
                } else {
                    Ok("values")
                }
            }
        })
        .await;

    assert_eq!(result.expect("should succeed"), "values");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

/// Validates that permanent errors are surfaced after a single attempt.
///
/// # Test Steps
/// 1. Fail with a non-retryable permission error
/// 2. Confirm `NonRetryable` carrying the original error
#[tokio::test]
async fn test_classified_retry_surfaces_permanent_errors() {
    let executor = RetryExecutor::with_policy(policies::ClassifiedRetry);

    let result: Result<(), _> =
        executor.execute(|_| async { Err(UpstreamFailure::Forbidden) }).await;

    match result {
        Err(RetryError::NonRetryable { source }) => assert_eq!(source, UpstreamFailure::Forbidden),
        other => panic!("expected NonRetryable, got {other:?}"),
    }
}
