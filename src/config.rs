// src/config.rs
//! Layered service configuration.
//!
//! Resolution:
//! 1) `$AGGREGATOR_CONFIG_PATH` (must exist)
//! 2) `config/aggregator.toml`
//! 3) `config/aggregator.json`
//! 4) built-in defaults
//!
//! Hot knobs can then be overridden from the environment.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::HttpBackendConfig;
use crate::cache::ResultCache;
use crate::rate_limit::RateLimitConfig;
use crate::registry::ServiceRegistry;
use crate::retry::RetryPolicy;
use crate::types::SearchOptions;

pub const ENV_CONFIG_PATH: &str = "AGGREGATOR_CONFIG_PATH";
pub const ENV_SEARCH_TIMEOUT_MS: &str = "AGGREGATOR_SEARCH_TIMEOUT_MS";
pub const ENV_CACHE_TTL_MS: &str = "AGGREGATOR_CACHE_TTL_MS";
pub const ENV_CACHE_MAX_SIZE: &str = "AGGREGATOR_CACHE_MAX_SIZE";

const DEFAULT_TOML_PATH: &str = "config/aggregator.toml";
const DEFAULT_JSON_PATH: &str = "config/aggregator.json";

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct AggregatorConfig {
    pub search: SearchSection,
    pub cache: CacheSection,
    pub registry: RegistrySection,
    pub retry: RetrySection,
    pub rate_limit: RateLimitConfig,
    pub backends: Vec<BackendSection>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub timeout_ms: u64,
    pub use_healthy_services_only: bool,
    pub max_concurrent_requests: usize,
    pub salvage_on_timeout: bool,
}

impl Default for SearchSection {
    fn default() -> Self {
        let d = SearchOptions::default();
        Self {
            timeout_ms: d.timeout_ms,
            use_healthy_services_only: d.use_healthy_services_only,
            max_concurrent_requests: d.max_concurrent_requests,
            salvage_on_timeout: d.salvage_on_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub default_ttl_ms: u64,
    pub max_size: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_ms: crate::cache::DEFAULT_TTL.as_millis() as u64,
            max_size: crate::cache::DEFAULT_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub health_ttl_ms: u64,
    pub health_timeout_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            health_ttl_ms: crate::registry::DEFAULT_HEALTH_TTL.as_millis() as u64,
            health_timeout_ms: crate::registry::DEFAULT_HEALTH_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let d = RetryPolicy::default();
        Self {
            max_retries: d.max_retries,
            base_delay_ms: d.base_delay.as_millis() as u64,
            multiplier: d.multiplier,
            max_delay_ms: d.max_delay.as_millis() as u64,
        }
    }
}

/// One upstream volunteer API speaking the common opportunity schema.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendSection {
    pub id: String,
    pub base_url: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_search_path")]
    pub details_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    /// Name of the env var holding the API key, never the key itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub requests_per_hour: Option<u32>,
}

fn default_search_path() -> String {
    "/opportunities".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

impl BackendSection {
    /// Per-backend limits, falling back to the global ones field by field.
    pub fn rate_limit(&self, global: RateLimitConfig) -> Option<RateLimitConfig> {
        if self.requests_per_minute.is_none() && self.requests_per_hour.is_none() {
            return None;
        }
        Some(RateLimitConfig::new(
            self.requests_per_minute.unwrap_or(global.requests_per_minute),
            self.requests_per_hour.unwrap_or(global.requests_per_hour),
        ))
    }

    /// Adapter settings; the API key is read from `api_key_env` if set.
    pub fn http_config(&self) -> HttpBackendConfig {
        let mut c = HttpBackendConfig::new(&self.id, &self.base_url);
        c.search_path = self.search_path.clone();
        c.details_path = self.details_path.clone();
        c.health_path = self.health_path.clone();
        c.timeout = Duration::from_millis(self.timeout_ms.max(1));
        c.api_key = self
            .api_key_env
            .as_deref()
            .and_then(|k| std::env::var(k).ok())
            .filter(|v| !v.trim().is_empty());
        c
    }
}

impl AggregatorConfig {
    /// Load from an explicit path. TOML or JSON, chosen by extension.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = parse(&content, ext.as_str())
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg.sanitized())
    }

    /// Resolve the file (see module docs), then apply env overrides.
    pub fn load_default() -> Result<Self> {
        let mut cfg = Self::load_file_default()?;
        cfg.apply_env_overrides()?;
        Ok(cfg.sanitized())
    }

    fn load_file_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let toml_p = PathBuf::from(DEFAULT_TOML_PATH);
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        let json_p = PathBuf::from(DEFAULT_JSON_PATH);
        if json_p.exists() {
            return Self::load_from(&json_p);
        }
        Ok(Self::default())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_number::<u64>(ENV_SEARCH_TIMEOUT_MS)? {
            self.search.timeout_ms = v;
        }
        if let Some(v) = env_number::<u64>(ENV_CACHE_TTL_MS)? {
            self.cache.default_ttl_ms = v;
        }
        if let Some(v) = env_number::<usize>(ENV_CACHE_MAX_SIZE)? {
            self.cache.max_size = v;
        }
        Ok(())
    }

    /// Clamp values that would make a component unusable.
    pub fn sanitized(mut self) -> Self {
        self.search.timeout_ms = self.search.timeout_ms.max(1);
        self.search.max_concurrent_requests = self.search.max_concurrent_requests.max(1);
        self.cache.default_ttl_ms = self.cache.default_ttl_ms.max(1);
        self.cache.max_size = self.cache.max_size.max(1);
        self.rate_limit.requests_per_minute = self.rate_limit.requests_per_minute.max(1);
        self.rate_limit.requests_per_hour = self.rate_limit.requests_per_hour.max(1);
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            self.retry.multiplier = RetrySection::default().multiplier;
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms;
        }
        self.backends.retain(|b| !b.id.trim().is_empty());
        self
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            timeout_ms: self.search.timeout_ms,
            use_healthy_services_only: self.search.use_healthy_services_only,
            max_concurrent_requests: self.search.max_concurrent_requests,
            salvage_on_timeout: self.search.salvage_on_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn build_cache(&self) -> ResultCache {
        ResultCache::new(
            Duration::from_millis(self.cache.default_ttl_ms),
            self.cache.max_size,
        )
    }

    pub fn build_registry(&self) -> ServiceRegistry {
        ServiceRegistry::new(
            Duration::from_millis(self.registry.health_ttl_ms),
            Duration::from_millis(self.registry.health_timeout_ms),
        )
    }
}

fn parse(s: &str, hint_ext: &str) -> Result<AggregatorConfig> {
    match hint_ext {
        "json" => serde_json::from_str(s).context("invalid JSON config"),
        "toml" => toml::from_str(s).context("invalid TOML config"),
        // Unknown extension: JSON objects start with '{', everything else is TOML.
        _ if s.trim_start().starts_with('{') => {
            serde_json::from_str(s).context("invalid JSON config")
        }
        _ => toml::from_str(s).context("invalid TOML config"),
    }
}

fn env_number<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{key}={v}: {e}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    const SAMPLE: &str = r#"
[search]
timeout_ms = 8000
salvage_on_timeout = true

[cache]
max_size = 0

[retry]
multiplier = 0.5

[[backends]]
id = "volunteer-hub"
base_url = "https://api.example.org"
requests_per_minute = 10
"#;

    #[test]
    fn toml_sections_fill_defaults_and_sanitize() {
        let cfg = parse(SAMPLE, "toml").unwrap().sanitized();
        assert_eq!(cfg.search.timeout_ms, 8000);
        assert!(cfg.search.salvage_on_timeout);
        assert_eq!(cfg.search.max_concurrent_requests, 5);
        assert_eq!(cfg.cache.max_size, 1);
        assert_eq!(cfg.cache.default_ttl_ms, 300_000);
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.backends.len(), 1);
        let b = &cfg.backends[0];
        assert_eq!(b.search_path, "/opportunities");
        assert_eq!(b.timeout_ms, 10_000);
        let rl = b.rate_limit(cfg.rate_limit).unwrap();
        assert_eq!(rl.requests_per_minute, 10);
        assert_eq!(rl.requests_per_hour, 1000);
    }

    #[test]
    fn json_is_accepted() {
        let cfg = parse(r#"{"cache":{"default_ttl_ms":1000}}"#, "").unwrap();
        assert_eq!(cfg.cache.default_ttl_ms, 1000);
        assert!(cfg.backends.is_empty());
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks_then_overrides() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_SEARCH_TIMEOUT_MS);

        // no files → defaults
        let cfg = AggregatorConfig::load_default().unwrap();
        assert_eq!(cfg, AggregatorConfig::default().sanitized());

        // config/aggregator.json is picked up
        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(
            tmp.path().join("config/aggregator.json"),
            r#"{"search":{"timeout_ms":2000}}"#,
        )
        .unwrap();
        assert_eq!(AggregatorConfig::load_default().unwrap().search.timeout_ms, 2000);

        // explicit path wins, env override wins over the file
        let p = tmp.path().join("custom.toml");
        fs::write(&p, "[search]\ntimeout_ms = 3000\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(AggregatorConfig::load_default().unwrap().search.timeout_ms, 3000);
        env::set_var(ENV_SEARCH_TIMEOUT_MS, "4000");
        assert_eq!(AggregatorConfig::load_default().unwrap().search.timeout_ms, 4000);

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(AggregatorConfig::load_default().is_err());

        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_SEARCH_TIMEOUT_MS);
        env::set_current_dir(&old).unwrap();
    }
}
