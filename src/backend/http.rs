//! Generic reqwest-backed adapter.
//!
//! Vendor specifics (query parameters, payload shape) live behind
//! [`OpportunityMapper`]; this type owns the network protocol: rate-limit
//! gate, per-request timeout, error classification and retry with backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::RETRY_AFTER, Client, Url};
use serde_json::Value;
use tracing::{debug, warn};

use super::{BackendClient, HealthCheck};
use crate::error::ApiError;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::types::{BackendResult, Opportunity, SearchQuery, SearchType};

/// Maps between the common record shape and one vendor's API.
pub trait OpportunityMapper: Send + Sync {
    fn search_params(&self, query: &SearchQuery) -> Vec<(String, String)>;
    fn map_search(&self, source: &str, body: Value) -> Result<Vec<Opportunity>, String>;
    fn map_details(&self, source: &str, body: Value) -> Result<Opportunity, String>;
}

/// For upstreams that already speak the common shape, either a bare array or
/// `{"opportunities": [...]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommonSchemaMapper;

impl OpportunityMapper for CommonSchemaMapper {
    fn search_params(&self, query: &SearchQuery) -> Vec<(String, String)> {
        let mut params = vec![
            ("lat".to_string(), query.coordinates.latitude.to_string()),
            ("lng".to_string(), query.coordinates.longitude.to_string()),
            ("radius".to_string(), query.radius_miles.to_string()),
            ("limit".to_string(), query.result_limit.to_string()),
        ];
        if let Some(causes) = query.causes.as_ref().filter(|c| !c.is_empty()) {
            params.push(("causes".to_string(), causes.join(",")));
        }
        if query.search_type != SearchType::Both {
            params.push(("type".to_string(), query.search_type.as_str().to_string()));
        }
        params
    }

    fn map_search(&self, source: &str, body: Value) -> Result<Vec<Opportunity>, String> {
        let list = match body {
            Value::Array(_) => body,
            Value::Object(mut obj) => obj
                .remove("opportunities")
                .ok_or_else(|| "payload has no `opportunities` field".to_string())?,
            other => return Err(format!("unexpected payload: {other}")),
        };
        let mut out: Vec<Opportunity> =
            serde_json::from_value(list).map_err(|e| format!("bad opportunity list: {e}"))?;
        for o in out.iter_mut().filter(|o| o.source.is_empty()) {
            o.source = source.to_string();
        }
        Ok(out)
    }

    fn map_details(&self, source: &str, body: Value) -> Result<Opportunity, String> {
        let mut o: Opportunity =
            serde_json::from_value(body).map_err(|e| format!("bad opportunity: {e}"))?;
        if o.source.is_empty() {
            o.source = source.to_string();
        }
        Ok(o)
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub id: String,
    pub base_url: String,
    pub search_path: String,
    /// Prefix; the opportunity id is appended as a path segment.
    pub details_path: String,
    pub health_path: String,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl HttpBackendConfig {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            search_path: "/opportunities".to_string(),
            details_path: "/opportunities".to_string(),
            health_path: "/health".to_string(),
            timeout: Duration::from_secs(10),
            api_key: None,
        }
    }
}

pub struct HttpBackend {
    config: HttpBackendConfig,
    client: Client,
    mapper: Arc<dyn OpportunityMapper>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpBackend {
    pub fn new(
        config: HttpBackendConfig,
        mapper: Arc<dyn OpportunityMapper>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("volunteer-search-aggregator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .build()
            .context("building reqwest client")?;
        Url::parse(&config.base_url)
            .with_context(|| format!("invalid base_url for backend {}", config.id))?;
        Ok(Self {
            config,
            client,
            mapper,
            limiter,
            retry,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        let raw = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|e| ApiError::network(&self.config.id, format!("bad url {raw}: {e}")))
    }

    /// GET with retry; every attempt goes through the rate limiter.
    async fn get_json(
        &self,
        url: &Url,
        params: &[(String, String)],
        retry: RetryPolicy,
    ) -> Result<Value, ApiError> {
        retry
            .run(&self.config.id, move |attempt| async move {
                self.limiter.acquire().await;
                self.attempt_get(url, params, attempt).await
            })
            .await
    }

    async fn attempt_get(
        &self,
        url: &Url,
        params: &[(String, String)],
        attempt: u32,
    ) -> Result<Value, ApiError> {
        let id = self.config.id.as_str();
        let started = Instant::now();

        let mut req = self
            .client
            .get(url.clone())
            .query(params)
            .timeout(self.config.timeout);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(
                    target: "backend",
                    backend = id,
                    method = "GET",
                    path = url.path(),
                    attempt,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "backend request failed"
                );
                return Err(ApiError::from_reqwest(id, &e));
            }
        };

        let status = resp.status();
        debug!(
            target: "backend",
            backend = id,
            method = "GET",
            path = url.path(),
            attempt,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "backend request"
        );

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| parse_retry_after(s, Utc::now()));
            return Err(ApiError::from_status(id, status.as_u16(), retry_after));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ApiError::invalid_response(id, format!("unparsable payload: {e}")))
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date. A date in the past means
/// retry now.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[async_trait]
impl BackendClient for HttpBackend {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn search(&self, query: &SearchQuery) -> BackendResult {
        let id = self.config.id.as_str();
        let started = Instant::now();
        let params = self.mapper.search_params(query);

        let outcome = match self.url(&self.config.search_path) {
            Ok(url) => self.get_json(&url, &params, self.retry).await,
            Err(e) => Err(e),
        }
        .and_then(|body| {
            self.mapper
                .map_search(id, body)
                .map_err(|m| ApiError::invalid_response(id, m))
        });

        let ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut opportunities) => {
                opportunities.truncate(query.result_limit);
                BackendResult::ok(id, opportunities, ms)
            }
            Err(e) => {
                warn!(target: "backend", backend = id, kind = e.kind.as_str(), error = %e.message, "search failed");
                BackendResult::failed(id, e, Some(ms))
            }
        }
    }

    async fn get_details(&self, opportunity_id: &str) -> Result<Opportunity, ApiError> {
        let id = self.config.id.as_str();
        let mut url = self.url(&self.config.details_path)?;
        url.path_segments_mut()
            .map_err(|_| ApiError::network(id, "base url cannot carry a path"))?
            .pop_if_empty()
            .push(opportunity_id);

        let body = self.get_json(&url, &[], self.retry).await?;
        self.mapper
            .map_details(id, body)
            .map_err(|m| ApiError::invalid_response(id, m))
    }

    async fn health_check(&self) -> HealthCheck {
        let started = Instant::now();
        let url = match self.url(&self.config.health_path) {
            Ok(u) => u,
            Err(e) => return HealthCheck::unhealthy(e.message, None),
        };
        let res = self
            .client
            .get(url)
            .timeout(self.config.timeout)
            .send()
            .await;
        let ms = started.elapsed().as_millis() as u64;
        match res {
            Ok(r) if r.status().is_success() => HealthCheck::healthy(ms),
            Ok(r) => HealthCheck::unhealthy(format!("HTTP {}", r.status().as_u16()), Some(ms)),
            Err(e) => HealthCheck::unhealthy(e.to_string(), Some(ms)),
        }
    }
}
