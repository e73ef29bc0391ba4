// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod geo;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::backend::{BackendClient, DynBackend, HealthCheck};
pub use crate::cache::{CacheStats, InvalidationCriteria, ResultCache};
pub use crate::engine::SearchController;
pub use crate::error::{ApiError, ApiErrorKind, EngineError};
pub use crate::rate_limit::{RateLimitConfig, RateLimiter, RateLimiterManager};
pub use crate::registry::ServiceRegistry;
pub use crate::retry::RetryPolicy;
pub use crate::types::{
    AggregatedResult, Coordinates, LocationTarget, MultiLocationFilters, MultiLocationResult,
    Opportunity, SearchOptions, SearchQuery, SearchType, ServiceStatus,
};
