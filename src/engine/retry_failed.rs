//! Re-query only the backends that failed with a retryable error and fold
//! their fresh outcomes into an earlier result.

use std::collections::HashMap;
use std::time::Duration;

use metrics::histogram;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{aggregate, elapsed_ms, finalize, SearchController};
use crate::cache::CacheMetadata;
use crate::dispatch::fan_out;
use crate::error::{ApiError, EngineError, AGGREGATOR_SOURCE};
use crate::types::{AggregatedResult, BackendResult, SearchOptions, SearchQuery};

impl SearchController {
    /// Healthy backends are not re-queried; their opportunities are carried
    /// over from `previous`. Backends that are no longer registered keep their
    /// old status. Unfinished retries at the deadline count as timeouts.
    pub async fn retry_failed_sources(
        &self,
        query: &SearchQuery,
        previous: &AggregatedResult,
        options: SearchOptions,
    ) -> Result<AggregatedResult, EngineError> {
        query.validate()?;
        let started = Instant::now();

        let clients: Vec<_> = previous
            .service_statuses
            .iter()
            .filter(|s| s.is_retryable_failure())
            .filter_map(|s| self.registry.get(&s.source))
            .collect();

        if clients.is_empty() {
            debug!(target: "engine", "no retryable sources in previous result");
            return Ok(previous.clone());
        }

        let retried: Vec<String> = clients.iter().map(|c| c.id().to_string()).collect();
        info!(target: "engine", sources = ?retried, "retrying failed sources");

        let fan = fan_out(clients, query, Some(Duration::from_millis(options.timeout_ms))).await;
        let mut outcomes = fan.completed;
        for id in fan.pending {
            let err = ApiError::timeout(&id, "no response before the search deadline");
            outcomes.push(BackendResult::failed(id, err, Some(options.timeout_ms)));
        }
        let fresh = aggregate(outcomes);

        let mut result = merge_retry(previous, fresh, &retried);
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
            errors = result.errors.len(),
            partial = result.partial_results,
            response_ms = result.response_time_ms,
            "retry aggregated"
        );
        Ok(result)
    }
}

fn merge_retry(
    previous: &AggregatedResult,
    fresh: AggregatedResult,
    retried: &[String],
) -> AggregatedResult {
    let was_retried = |source: &str| retried.iter().any(|r| r == source);

    let mut result = AggregatedResult {
        sources: previous.sources.clone(),
        ..AggregatedResult::default()
    };
    result.opportunities = previous
        .opportunities
        .iter()
        .filter(|o| !was_retried(&o.source))
        .cloned()
        .collect();
    result.errors = previous
        .errors
        .iter()
        .filter(|e| e.backend != AGGREGATOR_SOURCE && !was_retried(&e.backend))
        .cloned()
        .collect();

    let mut replaced: HashMap<String, _> = fresh
        .service_statuses
        .into_iter()
        .map(|s| (s.source.clone(), s))
        .collect();
    result.service_statuses = previous
        .service_statuses
        .iter()
        .map(|s| replaced.remove(&s.source).unwrap_or_else(|| s.clone()))
        .collect();

    for s in fresh.sources {
        if !result.sources.contains(&s) {
            result.sources.push(s);
        }
    }
    result.opportunities.extend(fresh.opportunities);
    result.errors.extend(fresh.errors);

    finalize(&mut result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::sample_opportunity;
    use crate::error::ApiErrorKind;
    use crate::types::ServiceStatus;

    fn failed_status(source: &str, kind: ApiErrorKind) -> ServiceStatus {
        ServiceStatus {
            source: source.into(),
            healthy: false,
            response_time_ms: None,
            result_count: 0,
            error: Some(ApiError::new(kind, source, "down")),
        }
    }

    #[test]
    fn merge_replaces_retried_status_and_keeps_the_rest() {
        let previous = AggregatedResult {
            opportunities: vec![sample_opportunity("a", 0)],
            total_count: 1,
            sources: vec!["a".into(), "b".into()],
            errors: vec![ApiError::network("b", "down")],
            response_time_ms: 10,
            partial_results: true,
            service_statuses: vec![
                ServiceStatus {
                    source: "a".into(),
                    healthy: true,
                    response_time_ms: Some(5),
                    result_count: 1,
                    error: None,
                },
                failed_status("b", ApiErrorKind::Network),
            ],
            from_cache: false,
        };
        let fresh = aggregate(vec![BackendResult::ok(
            "b",
            vec![sample_opportunity("b", 0), sample_opportunity("b", 1)],
            7,
        )]);

        let r = merge_retry(&previous, fresh, &["b".to_string()]);
        assert_eq!(r.total_count, 3);
        assert!(r.errors.is_empty());
        assert!(!r.partial_results);
        assert_eq!(r.service_statuses.len(), 2);
        assert!(r.service_statuses.iter().all(|s| s.healthy));
        assert_eq!(r.sources, vec!["a".to_string(), "b".to_string()]);
    }
}
