//! # Backend Client contract
//! What every upstream adapter provides. `search` never fails: problems are
//! reported inside the returned [`BackendResult`]. `get_details` returns a
//! typed [`ApiError`] on failure, and `health_check` reports unhealthy rather
//! than erroring.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::types::{BackendResult, Opportunity, SearchQuery};

pub use http::{CommonSchemaMapper, HttpBackend, HttpBackendConfig, OpportunityMapper};
pub use mock::{MockBackend, MockBehavior};

/// Result of a lightweight reachability probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheck {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            healthy: true,
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>, response_time_ms: Option<u64>) -> Self {
        Self {
            healthy: false,
            response_time_ms,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Stable identifier; used as the key everywhere.
    fn id(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> BackendResult;

    async fn get_details(&self, id: &str) -> Result<Opportunity, ApiError>;

    async fn health_check(&self) -> HealthCheck;
}

pub type DynBackend = Arc<dyn BackendClient>;
