use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// Register descriptions for every series the aggregator emits. Idempotent.
pub fn describe() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("aggregator_searches_total", "Validated single-location searches.");
        describe_histogram!(
            "aggregator_search_duration_ms",
            "End-to-end search time in milliseconds (cache hits excluded)."
        );
        describe_counter!("aggregator_cache_hits_total", "Result cache hits.");
        describe_counter!(
            "aggregator_cache_misses_total",
            "Result cache misses, including expired entries."
        );
        describe_counter!(
            "aggregator_cache_evictions_total",
            "Entries dropped for expiry or capacity."
        );
        describe_gauge!("aggregator_cache_entries", "Entries currently cached.");
        describe_counter!(
            "aggregator_backend_failures_total",
            "Failed backend searches by source and error kind."
        );
        describe_counter!(
            "aggregator_backend_retries_total",
            "Backend request retries after a retryable error."
        );
        describe_counter!(
            "aggregator_rate_limit_waits_total",
            "Requests delayed by a backend rate limiter."
        );
        describe_counter!(
            "aggregator_search_timeouts_total",
            "Searches that hit the global deadline."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the configured cache bounds.
    pub fn init(cache_ttl_ms: u64, cache_max_size: usize) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        describe();
        gauge!("aggregator_cache_ttl_ms").set(cache_ttl_ms as f64);
        gauge!("aggregator_cache_max_size").set(cache_max_size as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
