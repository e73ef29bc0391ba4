//! # Rate Limiter
//! Per-backend sliding-window admission control.
//!
//! Each limiter keeps one ordered list of request timestamps and filters it
//! against two cutoffs (last minute, last hour). A request is admitted only
//! when both windows are under their limit. Waiting is computed from the
//! oldest timestamp of whichever window is binding, so callers sleep exactly
//! until a slot frees up instead of polling.
//!
//! Timestamps use `tokio::time::Instant`, which lets tests drive the windows
//! with `tokio::time::advance`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn new(requests_per_minute: u32, requests_per_hour: u32) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
        }
    }

    /// A zero limit would block forever; treat it as 1.
    fn sanitized(self) -> Self {
        Self {
            requests_per_minute: self.requests_per_minute.max(1),
            requests_per_hour: self.requests_per_hour.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub backend: String,
    pub count_last_minute: u32,
    pub count_last_hour: u32,
    pub minute_limit: u32,
    pub hour_limit: u32,
    /// Time until the oldest request in the minute window expires.
    pub ms_until_reset: u64,
}

/// Thread-safe sliding-window limiter for one backend.
#[derive(Debug)]
pub struct RateLimiter {
    backend: String,
    config: RateLimitConfig,
    inner: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(backend: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            backend: backend.into(),
            config: config.sanitized(),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a request issued now would be admitted.
    pub fn is_allowed(&self) -> bool {
        let now = Instant::now();
        let mut buf = self.lock();
        purge(&mut buf, now);
        self.delay_locked(&buf, now).is_zero()
    }

    /// Count a request issued now.
    pub fn record(&self) {
        let now = Instant::now();
        let mut buf = self.lock();
        purge(&mut buf, now);
        buf.push_back(now);
    }

    /// Suspend until a request would be admitted. Does not record.
    pub async fn wait_until_allowed(&self) {
        loop {
            let delay = {
                let now = Instant::now();
                let mut buf = self.lock();
                purge(&mut buf, now);
                self.delay_locked(&buf, now)
            };
            if delay.is_zero() {
                return;
            }
            counter!("aggregator_rate_limit_waits_total").increment(1);
            tracing::debug!(
                target: "rate_limit",
                backend = %self.backend,
                delay_ms = delay.as_millis() as u64,
                "waiting for rate limit window"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for a slot and claim it in the same critical section, so two
    /// concurrent callers can never both take the last slot.
    pub async fn acquire(&self) {
        loop {
            let delay = {
                let now = Instant::now();
                let mut buf = self.lock();
                purge(&mut buf, now);
                let delay = self.delay_locked(&buf, now);
                if delay.is_zero() {
                    buf.push_back(now);
                    return;
                }
                delay
            };
            counter!("aggregator_rate_limit_waits_total").increment(1);
            tracing::debug!(
                target: "rate_limit",
                backend = %self.backend,
                delay_ms = delay.as_millis() as u64,
                "waiting for rate limit slot"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut buf = self.lock();
        purge(&mut buf, now);
        let minute = in_window(&buf, now, MINUTE);
        let ms_until_reset = minute
            .clone()
            .next()
            .map(|oldest| expires_in(*oldest, now, MINUTE).as_millis() as u64)
            .unwrap_or(0);
        RateLimitStatus {
            backend: self.backend.clone(),
            count_last_minute: minute.count() as u32,
            count_last_hour: buf.len() as u32,
            minute_limit: self.config.requests_per_minute,
            hour_limit: self.config.requests_per_hour,
            ms_until_reset,
        }
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Zero when admitted; otherwise the time until the binding window frees a slot.
    fn delay_locked(&self, buf: &VecDeque<Instant>, now: Instant) -> Duration {
        let mut delay = Duration::ZERO;

        let minute_count = in_window(buf, now, MINUTE).count();
        if minute_count >= self.config.requests_per_minute as usize {
            // the slot frees when the entry `count - limit` positions in expires
            let idx = minute_count - self.config.requests_per_minute as usize;
            if let Some(t) = in_window(buf, now, MINUTE).nth(idx) {
                delay = delay.max(expires_in(*t, now, MINUTE));
            }
        }

        let hour_count = buf.len();
        if hour_count >= self.config.requests_per_hour as usize {
            let idx = hour_count - self.config.requests_per_hour as usize;
            if let Some(t) = buf.get(idx) {
                delay = delay.max(expires_in(*t, now, HOUR));
            }
        }

        delay
    }
}

/// Drop entries older than the hour window; the buffer is time-ordered.
fn purge(buf: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&t) = buf.front() {
        if now.saturating_duration_since(t) >= HOUR {
            buf.pop_front();
        } else {
            break;
        }
    }
}

fn in_window(
    buf: &VecDeque<Instant>,
    now: Instant,
    window: Duration,
) -> impl Iterator<Item = &Instant> + Clone {
    buf.iter()
        .filter(move |t| now.saturating_duration_since(**t) < window)
}

fn expires_in(t: Instant, now: Instant, window: Duration) -> Duration {
    window.saturating_sub(now.saturating_duration_since(t))
}

/// Lazily creates one limiter per backend and hands out the same instance on
/// every lookup.
#[derive(Debug, Default)]
pub struct RateLimiterManager {
    default_config: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterManager {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Per-backend limits; must be set before the backend's limiter is first used.
    pub fn with_override(mut self, backend: impl Into<String>, config: RateLimitConfig) -> Self {
        self.overrides.insert(backend.into(), config);
        self
    }

    pub fn limiter(&self, backend: &str) -> Arc<RateLimiter> {
        let mut map = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(backend.to_string())
            .or_insert_with(|| {
                let cfg = self
                    .overrides
                    .get(backend)
                    .copied()
                    .unwrap_or(self.default_config);
                Arc::new(RateLimiter::new(backend, cfg))
            })
            .clone()
    }

    pub fn is_allowed(&self, backend: &str) -> bool {
        self.limiter(backend).is_allowed()
    }

    pub fn record(&self, backend: &str) {
        self.limiter(backend).record()
    }

    pub async fn wait_until_allowed(&self, backend: &str) {
        self.limiter(backend).wait_until_allowed().await
    }

    pub fn status(&self, backend: &str) -> RateLimitStatus {
        self.limiter(backend).status()
    }

    /// Status of every limiter created so far, sorted by backend.
    pub fn status_all(&self) -> Vec<RateLimitStatus> {
        let limiters: Vec<Arc<RateLimiter>> = {
            let map = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        let mut out: Vec<RateLimitStatus> = limiters.iter().map(|l| l.status()).collect();
        out.sort_by(|a, b| a.backend.cmp(&b.backend));
        out
    }

    pub fn reset(&self, backend: &str) {
        let map = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(l) = map.get(backend) {
            l.reset();
        }
    }

    pub fn reset_all(&self) {
        let map = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        for l in map.values() {
            l.reset();
        }
    }
}
