//! # Error taxonomy
//! Backend failures are values, not exceptions: every adapter reports them as
//! an [`ApiError`] with a tagged [`ApiErrorKind`], and the engine folds them
//! into per-source statuses. [`EngineError`] is reserved for caller input that
//! is rejected before any network activity.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Source name used for errors raised by the aggregator itself.
pub const AGGREGATOR_SOURCE: &str = "aggregator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// No response reached us (DNS, connect, reset).
    Network,
    /// Client-side deadline exceeded, or HTTP 408.
    Timeout,
    /// HTTP 429.
    RateLimit,
    /// HTTP 502/503/504.
    ServiceUnavailable,
    /// Any other 5xx, or an aggregation-level failure.
    ServerError,
    /// HTTP 401/403.
    Authentication,
    /// HTTP 404, other 4xx, or a payload we could not parse.
    InvalidResponse,
}

impl ApiErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiErrorKind::Network
                | ApiErrorKind::Timeout
                | ApiErrorKind::RateLimit
                | ApiErrorKind::ServiceUnavailable
                | ApiErrorKind::ServerError
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ApiErrorKind::Authentication,
            408 => ApiErrorKind::Timeout,
            429 => ApiErrorKind::RateLimit,
            502..=504 => ApiErrorKind::ServiceUnavailable,
            500..=599 => ApiErrorKind::ServerError,
            _ => ApiErrorKind::InvalidResponse,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::Network => "network",
            ApiErrorKind::Timeout => "timeout",
            ApiErrorKind::RateLimit => "rate_limit",
            ApiErrorKind::ServiceUnavailable => "service_unavailable",
            ApiErrorKind::ServerError => "server_error",
            ApiErrorKind::Authentication => "authentication",
            ApiErrorKind::InvalidResponse => "invalid_response",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            ApiErrorKind::Network => "Could not reach this volunteer service.",
            ApiErrorKind::Timeout => "This volunteer service took too long to respond.",
            ApiErrorKind::RateLimit => "This volunteer service is receiving too many requests.",
            ApiErrorKind::ServiceUnavailable => {
                "This volunteer service is temporarily unavailable."
            }
            ApiErrorKind::ServerError => "This volunteer service reported an internal error.",
            ApiErrorKind::Authentication => "Access to this volunteer service was refused.",
            ApiErrorKind::InvalidResponse => {
                "This volunteer service returned data we could not use."
            }
        }
    }

    fn suggestions(&self) -> Vec<String> {
        let s: &[&str] = match self {
            ApiErrorKind::Network => &[
                "Check your internet connection",
                "Try again in a few moments",
            ],
            ApiErrorKind::Timeout => &["Try again", "Narrow the search radius"],
            ApiErrorKind::RateLimit => &["Wait a minute before searching again"],
            ApiErrorKind::ServiceUnavailable | ApiErrorKind::ServerError => &[
                "Try again later",
                "Results from other services are still shown",
            ],
            ApiErrorKind::Authentication => &["The service configuration needs attention"],
            ApiErrorKind::InvalidResponse => &[
                "Try a different location or filters",
                "Results from other services are still shown",
            ],
        };
        s.iter().map(|x| x.to_string()).collect()
    }
}

/// Structured failure of one backend call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{backend} ({}): {message}", .kind.as_str())]
pub struct ApiError {
    #[serde(rename = "type")]
    pub kind: ApiErrorKind,
    pub message: String,
    #[serde(rename = "source")]
    pub backend: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub user_message: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backend: backend.into(),
            retryable: kind.is_retryable(),
            status_code: None,
            retry_after_ms: None,
            user_message: kind.user_message().to_string(),
            suggestions: kind.suggestions(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(backend: impl Into<String>, status: u16, retry_after: Option<Duration>) -> Self {
        let kind = ApiErrorKind::from_status(status);
        let mut e = Self::new(kind, backend, format!("HTTP {status}"));
        e.status_code = Some(status);
        if kind == ApiErrorKind::RateLimit {
            e.retry_after_ms = retry_after.map(|d| d.as_millis() as u64);
        }
        e
    }

    /// Classify a transport-level failure from the HTTP client.
    pub fn from_reqwest(backend: impl Into<String>, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(backend, status.as_u16(), None);
        }
        let kind = if err.is_timeout() {
            ApiErrorKind::Timeout
        } else if err.is_decode() || err.is_body() {
            ApiErrorKind::InvalidResponse
        } else {
            ApiErrorKind::Network
        };
        Self::new(kind, backend, err.to_string())
    }

    pub fn network(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network, backend, message)
    }

    pub fn timeout(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Timeout, backend, message)
    }

    pub fn server_error(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::ServerError, backend, message)
    }

    pub fn invalid_response(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::InvalidResponse, backend, message)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Errors returned to callers as `Err`. Everything else is folded into the
/// aggregated result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("no search targets supplied")]
    NoTargets,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(ApiErrorKind::from_status(401), ApiErrorKind::Authentication);
        assert_eq!(ApiErrorKind::from_status(403), ApiErrorKind::Authentication);
        assert_eq!(ApiErrorKind::from_status(404), ApiErrorKind::InvalidResponse);
        assert_eq!(ApiErrorKind::from_status(400), ApiErrorKind::InvalidResponse);
        assert_eq!(ApiErrorKind::from_status(408), ApiErrorKind::Timeout);
        assert_eq!(ApiErrorKind::from_status(429), ApiErrorKind::RateLimit);
        assert_eq!(ApiErrorKind::from_status(503), ApiErrorKind::ServiceUnavailable);
        assert_eq!(ApiErrorKind::from_status(500), ApiErrorKind::ServerError);
    }

    #[test]
    fn only_transient_statuses_are_retryable() {
        for s in [408u16, 429, 500, 502, 503, 504] {
            assert!(ApiError::from_status("x", s, None).retryable, "{s}");
        }
        for s in [400u16, 401, 403, 404, 422] {
            assert!(!ApiError::from_status("x", s, None).retryable, "{s}");
        }
    }

    #[test]
    fn retry_after_only_kept_for_rate_limit() {
        let e = ApiError::from_status("x", 429, Some(Duration::from_secs(2)));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(2)));
        let e = ApiError::from_status("x", 503, Some(Duration::from_secs(2)));
        assert_eq!(e.retry_after(), None);
    }

    #[test]
    fn serializes_kind_as_type_and_backend_as_source() {
        let e = ApiError::server_error("alpha", "boom");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "server_error");
        assert_eq!(v["source"], "alpha");
        assert_eq!(v["retryable"], true);
        assert!(!v["suggestions"].as_array().unwrap().is_empty());
        assert_eq!(e.to_string(), "alpha (server_error): boom");
    }
}
