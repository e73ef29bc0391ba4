//! Volunteer Search Aggregator — Binary Entrypoint
//! Boots the Axum HTTP server: config, backends, registry, cache and routes.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volunteer_search_aggregator::{
    api::{self, AppState},
    backend::{CommonSchemaMapper, HttpBackend, OpportunityMapper},
    config::AggregatorConfig,
    engine::SearchController,
    metrics::Metrics,
    rate_limit::RateLimiterManager,
};

/// Compact logs by default, JSON with AGGREGATOR_LOG_JSON=1.
/// `try_init` so a subscriber installed by the runtime wins.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("volunteer_search_aggregator=info,warn"));
    let json = std::env::var("AGGREGATOR_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AggregatorConfig::load_default().context("loading aggregator config")?;
    let metrics = Metrics::init(cfg.cache.default_ttl_ms, cfg.cache.max_size)?;

    let mut limiters = RateLimiterManager::new(cfg.rate_limit);
    for b in &cfg.backends {
        if let Some(rl) = b.rate_limit(cfg.rate_limit) {
            limiters = limiters.with_override(&b.id, rl);
        }
    }
    let limiters = Arc::new(limiters);

    let registry = Arc::new(cfg.build_registry());
    let mapper: Arc<dyn OpportunityMapper> = Arc::new(CommonSchemaMapper);
    let retry = cfg.retry_policy();
    for b in &cfg.backends {
        match HttpBackend::new(b.http_config(), mapper.clone(), limiters.limiter(&b.id), retry) {
            Ok(client) => registry.register(Arc::new(client)),
            Err(e) => warn!(backend = %b.id, error = ?e, "skipping misconfigured backend"),
        }
    }
    if registry.ids().is_empty() {
        warn!("no backends configured; every search will report no services available");
    }

    let cache = Arc::new(cfg.build_cache());
    let controller =
        Arc::new(SearchController::new(registry, cache).with_defaults(cfg.search_options()));

    info!(
        backends = cfg.backends.len(),
        timeout_ms = cfg.search.timeout_ms,
        cache_ttl_ms = cfg.cache.default_ttl_ms,
        "aggregator ready"
    );

    let router = api::router(AppState::new(controller, limiters)).merge(metrics.router());
    Ok(router.into())
}
