//! Multi-location search: one independent single-location search per target,
//! all targets in parallel, re-merged with per-location statistics.

use std::collections::HashMap;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::info;

use super::{elapsed_ms, SearchController};
use crate::error::{ApiError, EngineError};
use crate::types::{
    AggregatedResult, LocationBreakdown, LocationGroup, LocationTarget, MultiLocationFilters,
    MultiLocationResult, SearchOptions, SearchQuery, SearchStatistics, ServiceStatus,
};

/// What one target produced; `result` is `None` when the search never ran.
struct TargetOutcome {
    group: LocationGroup,
    result: Option<AggregatedResult>,
}

impl SearchController {
    /// Targets are already geocoded; one without coordinates counts as failed.
    /// A failing target never aborts its siblings.
    pub async fn search_multi_location(
        &self,
        targets: &[LocationTarget],
        radius_miles: f64,
        filters: &MultiLocationFilters,
        options: SearchOptions,
    ) -> Result<MultiLocationResult, EngineError> {
        if targets.is_empty() {
            return Err(EngineError::NoTargets);
        }
        let started = Instant::now();

        let outcomes = join_all(
            targets
                .iter()
                .map(|t| self.search_target(t, radius_miles, filters, options)),
        )
        .await;

        let search_statistics = statistics(&outcomes);
        let mut merged = merge(&outcomes);
        merged.response_time_ms = elapsed_ms(started);

        info!(
            target: "engine",
            locations = search_statistics.total_locations,
            succeeded = search_statistics.successful_locations,
            failed = search_statistics.failed_locations,
            results = merged.total_count,
            "multi-location search aggregated"
        );

        Ok(MultiLocationResult {
            result: merged,
            location_groups: outcomes.into_iter().map(|o| o.group).collect(),
            search_statistics,
        })
    }

    async fn search_target(
        &self,
        target: &LocationTarget,
        radius_miles: f64,
        filters: &MultiLocationFilters,
        options: SearchOptions,
    ) -> TargetOutcome {
        let mut group = LocationGroup {
            location: target.original_input.clone(),
            display_location: target.display_location.clone(),
            coordinates: target.coordinates,
            opportunities: Vec::new(),
            search_success: false,
            error: None,
        };

        let Some(coordinates) = target.coordinates else {
            group.error = Some(format!("could not geocode \"{}\"", target.original_input));
            return TargetOutcome {
                group,
                result: None,
            };
        };

        let query = SearchQuery {
            coordinates,
            radius_miles,
            causes: filters.causes.clone(),
            search_type: filters.search_type,
            result_limit: filters.result_limit,
        };

        match self.search(&query, options).await {
            Err(e) => {
                group.error = Some(e.to_string());
                TargetOutcome {
                    group,
                    result: None,
                }
            }
            Ok(mut result) => {
                for o in result.opportunities.iter_mut() {
                    o.search_location = Some(target.original_input.clone());
                }
                let succeeded =
                    result.from_cache || result.service_statuses.iter().any(|s| s.healthy);
                group.search_success = succeeded;
                if succeeded {
                    group.opportunities = result.opportunities.clone();
                } else {
                    group.error = Some(describe_errors(&result.errors));
                }
                TargetOutcome {
                    group,
                    result: Some(result),
                }
            }
        }
    }
}

fn describe_errors(errors: &[ApiError]) -> String {
    if errors.is_empty() {
        return "no results from any service".to_string();
    }
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn statistics(outcomes: &[TargetOutcome]) -> SearchStatistics {
    let total_locations = outcomes.len();
    let successful_locations = outcomes.iter().filter(|o| o.group.search_success).count();
    let total_opportunities: usize = outcomes.iter().map(|o| o.group.opportunities.len()).sum();
    let average_per_location = if successful_locations > 0 {
        total_opportunities as f64 / successful_locations as f64
    } else {
        0.0
    };
    SearchStatistics {
        total_locations,
        successful_locations,
        failed_locations: total_locations - successful_locations,
        total_opportunities,
        average_per_location,
        location_breakdown: outcomes
            .iter()
            .map(|o| LocationBreakdown {
                location: o.group.location.clone(),
                count: o.group.opportunities.len(),
            })
            .collect(),
    }
}

/// Flatten every target into one result. Sources, errors and statuses are
/// keyed by backend: a backend counts as healthy if it answered for any target.
fn merge(outcomes: &[TargetOutcome]) -> AggregatedResult {
    let mut merged = AggregatedResult::default();
    let mut status_idx: HashMap<String, usize> = HashMap::new();

    for o in outcomes {
        merged.opportunities.extend(o.group.opportunities.iter().cloned());

        let Some(r) = &o.result else { continue };
        for s in &r.sources {
            if !merged.sources.contains(s) {
                merged.sources.push(s.clone());
            }
        }
        for status in &r.service_statuses {
            match status_idx.get(&status.source) {
                Some(&i) => combine(&mut merged.service_statuses[i], status),
                None => {
                    status_idx.insert(status.source.clone(), merged.service_statuses.len());
                    merged.service_statuses.push(status.clone());
                }
            }
        }
        for e in &r.errors {
            if !merged.errors.iter().any(|x| x.backend == e.backend) {
                merged.errors.push(e.clone());
            }
        }
    }

    // a backend that recovered for a later target is no longer an error
    let healthy: Vec<String> = merged
        .service_statuses
        .iter()
        .filter(|s| s.healthy)
        .map(|s| s.source.clone())
        .collect();
    merged.errors.retain(|e| !healthy.contains(&e.backend));

    let succeeded = outcomes.iter().filter(|o| o.group.search_success).count();
    let any_partial = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref())
        .any(|r| r.partial_results);
    merged.total_count = merged.opportunities.len();
    merged.partial_results = (succeeded > 0 && succeeded < outcomes.len()) || any_partial;
    merged
}

fn combine(into: &mut ServiceStatus, other: &ServiceStatus) {
    into.result_count += other.result_count;
    into.response_time_ms = match (into.response_time_ms, other.response_time_ms) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if other.healthy {
        into.healthy = true;
        into.error = None;
    } else if !into.healthy && into.error.is_none() {
        into.error = other.error.clone();
    }
}
