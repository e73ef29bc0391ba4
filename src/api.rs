use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::cache::{CacheStats, InvalidationCriteria};
use crate::engine::SearchController;
use crate::error::EngineError;
use crate::rate_limit::{RateLimitStatus, RateLimiterManager};
use crate::registry::RegistryStats;
use crate::types::{
    AggregatedResult, LocationTarget, MultiLocationFilters, MultiLocationResult, SearchOptions,
    SearchQuery, ServiceHealth,
};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SearchController>,
    pub limiters: Arc<RateLimiterManager>,
}

impl AppState {
    pub fn new(controller: Arc<SearchController>, limiters: Arc<RateLimiterManager>) -> Self {
        Self {
            controller,
            limiters,
        }
    }

    fn options(&self, requested: Option<SearchOptions>) -> SearchOptions {
        requested.unwrap_or_else(|| self.controller.default_options())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/search", post(search))
        .route("/search/multi", post(search_multi))
        .route("/search/retry", post(search_retry))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/invalidate", post(cache_invalidate))
        .route("/cache/configure", post(cache_configure))
        .route("/services", get(services))
        .route("/services/health", get(services_health))
        .route("/rate-limits", get(rate_limits))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct SearchReq {
    #[serde(flatten)]
    query: SearchQuery,
    #[serde(default)]
    options: Option<SearchOptions>,
}

async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchReq>,
) -> Result<Json<AggregatedResult>, EngineError> {
    let options = state.options(body.options);
    let result = state.controller.search(&body.query, options).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiReq {
    targets: Vec<LocationTarget>,
    radius_miles: f64,
    #[serde(default)]
    filters: MultiLocationFilters,
    #[serde(default)]
    options: Option<SearchOptions>,
}

async fn search_multi(
    State(state): State<AppState>,
    Json(body): Json<MultiReq>,
) -> Result<Json<MultiLocationResult>, EngineError> {
    let options = state.options(body.options);
    let result = state
        .controller
        .search_multi_location(&body.targets, body.radius_miles, &body.filters, options)
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct RetryReq {
    query: SearchQuery,
    previous: AggregatedResult,
    #[serde(default)]
    options: Option<SearchOptions>,
}

async fn search_retry(
    State(state): State<AppState>,
    Json(body): Json<RetryReq>,
) -> Result<Json<AggregatedResult>, EngineError> {
    let options = state.options(body.options);
    let result = state
        .controller
        .retry_failed_sources(&body.query, &body.previous, options)
        .await?;
    Ok(Json(result))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.controller.cache().stats())
}

async fn cache_clear(State(state): State<AppState>) -> Json<CacheStats> {
    state.controller.cache().clear();
    Json(state.controller.cache().stats())
}

#[derive(Serialize)]
struct InvalidateResp {
    removed: usize,
}

async fn cache_invalidate(
    State(state): State<AppState>,
    Json(criteria): Json<InvalidationCriteria>,
) -> Json<InvalidateResp> {
    let removed = state.controller.cache().invalidate(&criteria);
    Json(InvalidateResp { removed })
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConfigureReq {
    default_ttl_ms: Option<u64>,
    max_cache_size: Option<usize>,
}

async fn cache_configure(
    State(state): State<AppState>,
    Json(body): Json<ConfigureReq>,
) -> Json<CacheStats> {
    let cache = state.controller.cache();
    if let Some(ms) = body.default_ttl_ms {
        cache.set_default_ttl(Duration::from_millis(ms.max(1)));
    }
    if let Some(n) = body.max_cache_size {
        cache.set_max_size(n);
    }
    tracing::info!(
        target: "cache",
        default_ttl_ms = ?body.default_ttl_ms,
        max_cache_size = ?body.max_cache_size,
        "cache reconfigured"
    );
    Json(cache.stats())
}

async fn services(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.controller.registry().stats())
}

async fn services_health(State(state): State<AppState>) -> Json<Vec<ServiceHealth>> {
    Json(state.controller.registry().health_all().await)
}

async fn rate_limits(State(state): State<AppState>) -> Json<Vec<RateLimitStatus>> {
    Json(state.limiters.status_all())
}
