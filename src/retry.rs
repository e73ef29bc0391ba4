//! Exponential backoff for calls that hit the network.
//!
//! `delay = min(base * multiplier^attempt, max)`. Only errors whose kind is
//! retryable are retried; a `Retry-After` hint from a 429 stretches the
//! computed delay.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// No retries at all; used for health probes.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Backoff before retry number `attempt + 1` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let ms = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Run `op` until it succeeds, fails terminally, or the retry budget is
    /// spent. `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, backend: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !e.retryable || attempt >= self.max_retries {
                        return Err(e);
                    }
                    let mut delay = self.delay_for(attempt);
                    if let Some(hint) = e.retry_after() {
                        delay = delay.max(hint);
                    }
                    warn!(
                        target: "backend",
                        backend,
                        attempt = attempt + 1,
                        kind = e.kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying backend call"
                    );
                    counter!("aggregator_backend_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
