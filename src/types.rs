//! # Data model
//! Wire types shared by the backends, the registry, the cache and the engine.
//!
//! Everything serializes as camelCase JSON so the UI and the upstream adapters
//! see the same shape. Values produced by an adapter are never mutated after
//! the fact; the engine only clones and tags them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, EngineError};
use crate::geo;

/// Precision used for cache keys: 3 decimals is roughly 110m.
pub const KEY_COORD_DECIMALS: u32 = 3;

/// Default result limit when a caller leaves it out.
pub const DEFAULT_RESULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Both components rounded to `decimals` places.
    pub fn rounded(&self, decimals: u32) -> Self {
        Self {
            latitude: geo::round_to(self.latitude, decimals),
            longitude: geo::round_to(self.longitude, decimals),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// How an opportunity is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OpportunityType {
    #[default]
    InPerson,
    Virtual,
}

/// Type filter on a query; `Both` disables filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SearchType {
    InPerson,
    Virtual,
    #[default]
    Both,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::InPerson => "in-person",
            SearchType::Virtual => "virtual",
            SearchType::Both => "both",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

/// One volunteer listing in the common record shape.
/// Identity is `(source, id)`; the same real-world listing coming from two
/// sources is two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Opportunity {
    pub id: String,
    pub source: String,
    pub title: String,
    pub organization: String,
    pub description: String,
    pub location: String,
    pub city: String,
    pub country: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(rename = "type")]
    pub opportunity_type: OpportunityType,
    pub cause: String,
    pub skills: Vec<String>,
    pub time_commitment: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<u32>,
    pub contact_info: ContactInfo,
    pub external_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub last_updated: String,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_deadline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<String>>,
    /// Input text of the multi-location target this record was found for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_location: Option<String>,
}

/// A single-location search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub coordinates: Coordinates,
    pub radius_miles: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
    #[serde(rename = "type", default)]
    pub search_type: SearchType,
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
}

fn default_result_limit() -> usize {
    DEFAULT_RESULT_LIMIT
}

impl SearchQuery {
    pub fn new(coordinates: Coordinates, radius_miles: f64) -> Self {
        Self {
            coordinates,
            radius_miles,
            causes: None,
            search_type: SearchType::Both,
            result_limit: DEFAULT_RESULT_LIMIT,
        }
    }

    pub fn with_causes<I, S>(mut self, causes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.causes = Some(causes.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_limit(mut self, result_limit: usize) -> Self {
        self.result_limit = result_limit;
        self
    }

    /// Reject malformed queries before any network activity.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.coordinates.is_valid() {
            return Err(EngineError::InvalidQuery(format!(
                "coordinates out of range: ({}, {})",
                self.coordinates.latitude, self.coordinates.longitude
            )));
        }
        if !self.radius_miles.is_finite() || self.radius_miles <= 0.0 {
            return Err(EngineError::InvalidQuery(format!(
                "radius must be a positive number of miles, got {}",
                self.radius_miles
            )));
        }
        if self.result_limit == 0 {
            return Err(EngineError::InvalidQuery(
                "result limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical form: rounded coordinates, trimmed/lowercased/sorted causes.
    pub fn normalized(&self) -> Self {
        let causes = self.causes.as_ref().and_then(|cs| {
            let mut out: Vec<String> = cs
                .iter()
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
            out.sort();
            out.dedup();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        });
        Self {
            coordinates: self.coordinates.rounded(KEY_COORD_DECIMALS),
            radius_miles: self.radius_miles,
            causes,
            search_type: self.search_type,
            result_limit: self.result_limit,
        }
    }

    /// Cache key; semantically identical queries produce the same string.
    pub fn cache_key(&self) -> String {
        let n = self.normalized();
        let causes = n.causes.map(|c| c.join(",")).unwrap_or_default();
        format!(
            "{:.3},{:.3}|r={}|c={}|t={}|n={}",
            n.coordinates.latitude,
            n.coordinates.longitude,
            n.radius_miles,
            causes,
            n.search_type.as_str(),
            n.result_limit
        )
    }
}

/// Outcome of one `search` call against one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResult {
    pub source_name: String,
    pub opportunities: Vec<Opportunity>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl BackendResult {
    pub fn ok(source_name: impl Into<String>, opportunities: Vec<Opportunity>, ms: u64) -> Self {
        Self {
            source_name: source_name.into(),
            opportunities,
            success: true,
            error: None,
            response_time_ms: Some(ms),
        }
    }

    pub fn failed(source_name: impl Into<String>, error: ApiError, ms: Option<u64>) -> Self {
        Self {
            source_name: source_name.into(),
            opportunities: Vec::new(),
            success: false,
            error: Some(error),
            response_time_ms: ms,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// Per-backend line in an aggregated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub source: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub result_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ServiceStatus {
    pub fn is_retryable_failure(&self) -> bool {
        !self.healthy && self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

/// Merged answer for one search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub opportunities: Vec<Opportunity>,
    pub total_count: usize,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiError>,
    pub response_time_ms: u64,
    pub partial_results: bool,
    pub service_statuses: Vec<ServiceStatus>,
    #[serde(default)]
    pub from_cache: bool,
}

impl AggregatedResult {
    /// Operation-wide failure: no data, one synthetic error.
    pub fn failure(error: ApiError, response_time_ms: u64) -> Self {
        Self {
            errors: vec![error],
            response_time_ms,
            ..Self::default()
        }
    }

    pub fn successful_sources(&self) -> impl Iterator<Item = &str> {
        self.service_statuses
            .iter()
            .filter(|s| s.healthy)
            .map(|s| s.source.as_str())
    }
}

/// Knobs for a single search call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub timeout_ms: u64,
    pub use_healthy_services_only: bool,
    pub max_concurrent_requests: usize,
    /// Keep backends that finished before the global deadline.
    pub salvage_on_timeout: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            use_healthy_services_only: true,
            max_concurrent_requests: 5,
            salvage_on_timeout: false,
        }
    }
}

/// One already-geocoded target of a multi-location search.
/// `coordinates == None` means geocoding failed for this input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationTarget {
    pub original_input: String,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_location: Option<String>,
}

impl LocationTarget {
    pub fn new(original_input: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            original_input: original_input.into(),
            coordinates: Some(coordinates),
            display_location: None,
        }
    }

    pub fn ungeocoded(original_input: impl Into<String>) -> Self {
        Self {
            original_input: original_input.into(),
            coordinates: None,
            display_location: None,
        }
    }
}

/// Filters shared by every target of a multi-location search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiLocationFilters {
    pub causes: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub search_type: SearchType,
    pub result_limit: usize,
}

impl Default for MultiLocationFilters {
    fn default() -> Self {
        Self {
            causes: None,
            search_type: SearchType::Both,
            result_limit: DEFAULT_RESULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationGroup {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub opportunities: Vec<Opportunity>,
    pub search_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBreakdown {
    pub location: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchStatistics {
    pub total_locations: usize,
    pub successful_locations: usize,
    pub failed_locations: usize,
    pub total_opportunities: usize,
    pub average_per_location: f64,
    pub location_breakdown: Vec<LocationBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiLocationResult {
    #[serde(flatten)]
    pub result: AggregatedResult,
    pub location_groups: Vec<LocationGroup>,
    pub search_statistics: SearchStatistics,
}

/// Health snapshot of one backend as seen by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub source_name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_checked_at: DateTime<Utc>,
}
