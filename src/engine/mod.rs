//! # Aggregation Engine
//! Orchestrates one search: cache check → backend selection → parallel
//! dispatch under a global deadline → merge → cache write.
//!
//! Policy:
//! - Individual backend failures never fail the search; each becomes one
//!   `ServiceStatus` + one `ApiError`.
//! - The only operation-wide failures are "no backends available" and
//!   "global timeout exceeded"; both return an empty result carrying a single
//!   synthetic `server_error` from the aggregator.
//! - No cross-source deduplication: identical listings from two sources stay
//!   two records.
//!
//! The controller keeps no per-query state; the registry and the cache are
//! injected and shared.

mod multi;
mod retry_failed;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheMetadata, ResultCache};
use crate::dispatch::fan_out;
use crate::error::{ApiError, EngineError, AGGREGATOR_SOURCE};
use crate::registry::ServiceRegistry;
use crate::types::{AggregatedResult, BackendResult, SearchOptions, SearchQuery, ServiceStatus};

pub struct SearchController {
    registry: Arc<ServiceRegistry>,
    cache: Arc<ResultCache>,
    defaults: SearchOptions,
}

impl SearchController {
    pub fn new(registry: Arc<ServiceRegistry>, cache: Arc<ResultCache>) -> Self {
        crate::metrics::describe();
        Self {
            registry,
            cache,
            defaults: SearchOptions::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: SearchOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn default_options(&self) -> SearchOptions {
        self.defaults
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Single-location search. `Err` only for invalid input.
    pub async fn search(
        &self,
        query: &SearchQuery,
        options: SearchOptions,
    ) -> Result<AggregatedResult, EngineError> {
        query.validate()?;
        counter!("aggregator_searches_total").increment(1);
        let started = Instant::now();

        if let Some(hit) = self.cache.get_entry(query) {
            let ms = elapsed_ms(started);
            info!(
                target: "engine",
                results = hit.opportunities.len(),
                response_ms = ms,
                "search served from cache"
            );
            return Ok(AggregatedResult {
                total_count: hit.opportunities.len(),
                opportunities: hit.opportunities,
                sources: hit.metadata.sources,
                errors: Vec::new(),
                response_time_ms: ms,
                partial_results: false,
                service_statuses: Vec::new(),
                from_cache: true,
            });
        }

        let mut clients = if options.use_healthy_services_only {
            self.registry.get_healthy().await
        } else {
            self.registry.list()
        };
        let cap = options.max_concurrent_requests.max(1);
        if clients.len() > cap {
            debug!(
                target: "engine",
                selected = cap,
                skipped = clients.len() - cap,
                "backend selection capped"
            );
            clients.truncate(cap);
        }

        if clients.is_empty() {
            warn!(target: "engine", "no volunteer services available");
            return Ok(self.finish_failure(
                ApiError::server_error(AGGREGATOR_SOURCE, "no volunteer services available"),
                started,
            ));
        }

        let timeout = Duration::from_millis(options.timeout_ms);
        let fan = fan_out(clients, query, Some(timeout)).await;

        if fan.timed_out() {
            counter!("aggregator_search_timeouts_total").increment(1);
            warn!(
                target: "engine",
                timeout_ms = options.timeout_ms,
                pending = ?fan.pending,
                completed = fan.completed.len(),
                salvage = options.salvage_on_timeout,
                "search deadline exceeded"
            );
            if !options.salvage_on_timeout {
                return Ok(self.finish_failure(
                    ApiError::server_error(
                        AGGREGATOR_SOURCE,
                        format!("search timed out after {}ms", options.timeout_ms),
                    ),
                    started,
                ));
            }
        }

        let mut outcomes = fan.completed;
        for id in fan.pending {
            let err = ApiError::timeout(&id, "no response before the search deadline");
            outcomes.push(BackendResult::failed(id, err, Some(options.timeout_ms)));
        }

        let mut result = aggregate(outcomes);
        result.response_time_ms = elapsed_ms(started);

        if !result.opportunities.is_empty() {
            self.cache.set(
                query,
                result.opportunities.clone(),
                CacheMetadata {
                    total_results: result.total_count,
                    sources: result.sources.clone(),
                    response_time_ms: result.response_time_ms,
                },
                None,
            );
        }

        histogram!("aggregator_search_duration_ms").record(result.response_time_ms as f64);
        info!(
            target: "engine",
            results = result.total_count,
            sources = result.sources.len(),
            errors = result.errors.len(),
            partial = result.partial_results,
            response_ms = result.response_time_ms,
            "search aggregated"
        );
        Ok(result)
    }

    fn finish_failure(&self, error: ApiError, started: Instant) -> AggregatedResult {
        let ms = elapsed_ms(started);
        histogram!("aggregator_search_duration_ms").record(ms as f64);
        AggregatedResult::failure(error, ms)
    }
}

/// Merge per-backend outcomes. Exactly one status and one `sources` entry per
/// backend; failures contribute one error each.
pub(crate) fn aggregate(outcomes: Vec<BackendResult>) -> AggregatedResult {
    let mut result = AggregatedResult::default();
    let mut seen: HashSet<String> = HashSet::new();

    for outcome in outcomes {
        if !seen.insert(outcome.source_name.clone()) {
            continue;
        }
        result.sources.push(outcome.source_name.clone());

        if outcome.success {
            result.service_statuses.push(ServiceStatus {
                source: outcome.source_name,
                healthy: true,
                response_time_ms: outcome.response_time_ms,
                result_count: outcome.opportunities.len(),
                error: None,
            });
            result.opportunities.extend(outcome.opportunities);
        } else {
            let mut err = outcome.error.unwrap_or_else(|| {
                ApiError::server_error(&outcome.source_name, "backend reported failure")
            });
            err.backend = outcome.source_name.clone();
            counter!(
                "aggregator_backend_failures_total",
                "source" => outcome.source_name.clone(),
                "kind" => err.kind.as_str()
            )
            .increment(1);
            result.service_statuses.push(ServiceStatus {
                source: outcome.source_name,
                healthy: false,
                response_time_ms: outcome.response_time_ms,
                result_count: 0,
                error: Some(err.clone()),
            });
            result.errors.push(err);
        }
    }

    finalize(&mut result);
    result
}

/// Recompute derived fields after the lists changed.
pub(crate) fn finalize(result: &mut AggregatedResult) {
    let succeeded = result.service_statuses.iter().filter(|s| s.healthy).count();
    let failed = result.service_statuses.len() - succeeded;
    result.total_count = result.opportunities.len();
    result.partial_results = succeeded > 0 && failed > 0;
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::sample_opportunity;
    use crate::error::ApiErrorKind;

    #[test]
    fn aggregate_counts_partial_and_wraps_missing_error() {
        let outcomes = vec![
            BackendResult::ok("a", vec![sample_opportunity("a", 0)], 5),
            BackendResult {
                source_name: "b".into(),
                opportunities: vec![],
                success: false,
                error: None,
                response_time_ms: None,
            },
        ];
        let r = aggregate(outcomes);
        assert!(r.partial_results);
        assert_eq!(r.total_count, 1);
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.errors[0].kind, ApiErrorKind::ServerError);
        assert_eq!(r.errors[0].backend, "b");
        assert_eq!(r.sources, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn aggregate_ignores_duplicate_source_ids() {
        let outcomes = vec![
            BackendResult::ok("a", vec![sample_opportunity("a", 0)], 5),
            BackendResult::ok("a", vec![sample_opportunity("a", 1)], 5),
        ];
        let r = aggregate(outcomes);
        assert_eq!(r.sources.len(), 1);
        assert_eq!(r.service_statuses.len(), 1);
        assert!(!r.partial_results);
    }

    #[test]
    fn all_failed_is_not_partial() {
        let e = ApiError::new(ApiErrorKind::Network, "a", "down");
        let r = aggregate(vec![BackendResult::failed("a", e, None)]);
        assert!(!r.partial_results);
        assert!(r.opportunities.is_empty());
    }
}
