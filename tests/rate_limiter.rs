// tests/rate_limiter.rs
//
// Sliding-window limiter under paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use volunteer_search_aggregator::rate_limit::{RateLimitConfig, RateLimiter, RateLimiterManager};

#[tokio::test(start_paused = true)]
async fn minute_window_blocks_then_reopens() {
    let limiter = RateLimiter::new("alpha", RateLimitConfig::new(5, 1000));
    for _ in 0..5 {
        assert!(limiter.is_allowed());
        limiter.record();
    }
    assert!(!limiter.is_allowed(), "6th request inside the minute is denied");

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(limiter.is_allowed());

    let status = limiter.status();
    assert_eq!(status.count_last_minute, 0);
    assert_eq!(status.count_last_hour, 5);
}

#[tokio::test(start_paused = true)]
async fn wait_until_allowed_sleeps_until_the_oldest_entry_expires() {
    let limiter = RateLimiter::new("alpha", RateLimitConfig::new(2, 1000));
    limiter.record();
    tokio::time::advance(Duration::from_secs(10)).await;
    limiter.record();

    let started = Instant::now();
    limiter.wait_until_allowed().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(50), "waited {waited:?}");
    assert!(waited <= Duration::from_secs(51), "waited {waited:?}");
    assert!(limiter.is_allowed());
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquire_never_over_admits() {
    let limiter = Arc::new(RateLimiter::new("alpha", RateLimitConfig::new(3, 1000)));
    let started = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let l = limiter.clone();
        handles.push(tokio::spawn(async move {
            l.acquire().await;
            Instant::now()
        }));
    }
    let mut admitted = Vec::new();
    for h in handles {
        admitted.push(h.await.unwrap());
    }

    let immediate = admitted
        .iter()
        .filter(|t| t.duration_since(started) < Duration::from_secs(1))
        .count();
    assert_eq!(immediate, 3, "only three slots in the first minute");
    assert_eq!(limiter.status().count_last_hour, 6);
}

#[test]
fn manager_hands_out_one_limiter_per_backend() {
    let mgr = RateLimiterManager::new(RateLimitConfig::default())
        .with_override("slow", RateLimitConfig::new(1, 10));
    let a1 = mgr.limiter("alpha");
    let a2 = mgr.limiter("alpha");
    assert!(Arc::ptr_eq(&a1, &a2));

    assert_eq!(mgr.limiter("slow").config().requests_per_minute, 1);
    assert_eq!(mgr.limiter("alpha").config().requests_per_minute, 60);

    mgr.record("slow");
    assert!(!mgr.is_allowed("slow"));
    assert!(mgr.is_allowed("alpha"));

    let all = mgr.status_all();
    let names: Vec<_> = all.iter().map(|s| s.backend.as_str()).collect();
    assert_eq!(names, vec!["alpha", "slow"]);

    mgr.reset_all();
    assert!(mgr.is_allowed("slow"));
}
