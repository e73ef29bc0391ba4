// tests/retry_policy.rs
//
// Backoff loop: what is retried, how often, and how long it waits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use volunteer_search_aggregator::error::{ApiError, ApiErrorKind};
use volunteer_search_aggregator::retry::RetryPolicy;

#[tokio::test(start_paused = true)]
async fn server_error_is_attempted_max_retries_plus_one_times() {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let res: Result<(), ApiError> = RetryPolicy::default()
        .run("alpha", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::from_status("alpha", 500, None)) }
        })
        .await;

    let err = res.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::ServerError);
    assert_eq!(err.status_code, Some(500));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // 1s + 2s + 4s of backoff
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(7), "waited {waited:?}");
    assert!(waited < Duration::from_millis(7100), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_not_retried() {
    for status in [400u16, 401, 403, 404] {
        let calls = AtomicU32::new(0);
        let res: Result<(), ApiError> = RetryPolicy::default()
            .run("alpha", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ApiError::from_status("alpha", status, None)) }
            })
            .await;
        assert!(!res.unwrap_err().retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "status {status}");
    }
}

#[tokio::test(start_paused = true)]
async fn recovers_after_transient_failures() {
    let res = RetryPolicy::default()
        .run("alpha", |attempt| async move {
            if attempt < 2 {
                Err(ApiError::network("alpha", "connection reset"))
            } else {
                Ok(attempt)
            }
        })
        .await;
    assert_eq!(res.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_stretches_the_backoff() {
    let started = Instant::now();
    let policy = RetryPolicy::default().with_max_retries(1);

    let res: Result<(), ApiError> = policy
        .run("alpha", |_| async {
            Err(ApiError::from_status(
                "alpha",
                429,
                Some(Duration::from_secs(5)),
            ))
        })
        .await;

    let err = res.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::RateLimit);
    assert_eq!(err.retry_after_ms, Some(5000));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5), "waited {waited:?}");
    assert!(waited < Duration::from_millis(5100), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn none_policy_makes_a_single_attempt() {
    let calls = AtomicU32::new(0);
    let _: Result<(), ApiError> = RetryPolicy::none()
        .run("alpha", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::timeout("alpha", "deadline")) }
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
