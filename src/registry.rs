//! # Service Registry
//! Owns the set of registered backends and a TTL-cached view of their health.
//!
//! Health probes never error: a failed, hanging or panicking probe shows up as
//! `healthy: false` with a message. The health cache is separate from the
//! result cache and has its own TTL. At most one probe per backend is in
//! flight; concurrent callers that find a stale entry wait for it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::backend::DynBackend;
use crate::dispatch::{fan_out, panic_message};
use crate::error::ApiError;
use crate::types::{BackendResult, SearchQuery, ServiceHealth};

pub const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CachedHealth {
    checked_at: Instant,
    health: ServiceHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_services: usize,
    /// Counted from fresh health-cache entries only.
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub cached_health_entries: usize,
    pub services: Vec<String>,
}

pub struct ServiceRegistry {
    clients: RwLock<Vec<DynBackend>>,
    health_cache: Mutex<HashMap<String, CachedHealth>>,
    probes_in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    health_ttl: Duration,
    health_timeout: Duration,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TTL, DEFAULT_HEALTH_TIMEOUT)
    }
}

impl ServiceRegistry {
    pub fn new(health_ttl: Duration, health_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            health_cache: Mutex::new(HashMap::new()),
            probes_in_flight: Mutex::new(HashMap::new()),
            health_ttl,
            health_timeout,
        }
    }

    /// Adds a backend; a backend with the same id is replaced in place.
    pub fn register(&self, client: DynBackend) {
        let id = client.id().to_string();
        {
            let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            match clients.iter().position(|c| c.id() == id) {
                Some(i) => clients[i] = client,
                None => clients.push(client),
            }
        }
        self.forget_health(&id);
        info!(target: "registry", backend = %id, "backend registered");
    }

    /// Returns whether a backend was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = {
            let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            let before = clients.len();
            clients.retain(|c| c.id() != id);
            clients.len() != before
        };
        self.forget_health(id);
        self.probes_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed {
            info!(target: "registry", backend = %id, "backend unregistered");
        }
        removed
    }

    /// All registered backends in registration order.
    pub fn list(&self) -> Vec<DynBackend> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<DynBackend> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    fn is_registered(&self, id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| c.id() == id)
    }

    fn forget_health(&self, id: &str) {
        self.health_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn fresh_health(&self, id: &str) -> Option<ServiceHealth> {
        self.health_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|c| c.checked_at.elapsed() < self.health_ttl)
            .map(|c| c.health.clone())
    }

    fn probe_guard(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.probes_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Cached health of one backend; probes only when the entry is stale.
    pub async fn health(&self, client: &DynBackend) -> ServiceHealth {
        let id = client.id().to_string();
        if let Some(h) = self.fresh_health(&id) {
            return h;
        }

        let guard = self.probe_guard(&id);
        let _in_flight = guard.lock().await;
        // Filled while we waited on another caller's probe.
        if let Some(h) = self.fresh_health(&id) {
            return h;
        }

        let health = self.probe(client).await;
        debug!(target: "registry", backend = %id, healthy = health.healthy, "health probed");
        if self.is_registered(&id) {
            self.health_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    id,
                    CachedHealth {
                        checked_at: Instant::now(),
                        health: health.clone(),
                    },
                );
        }
        health
    }

    async fn probe(&self, client: &DynBackend) -> ServiceHealth {
        let id = client.id().to_string();
        let started = Instant::now();
        let check = tokio::time::timeout(
            self.health_timeout,
            AssertUnwindSafe(client.health_check()).catch_unwind(),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match check {
            Ok(Ok(h)) => ServiceHealth {
                source_name: id,
                healthy: h.healthy,
                response_time_ms: h.response_time_ms.or(Some(elapsed_ms)),
                error: h.error,
                last_checked_at: Utc::now(),
            },
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref(), "health check panicked");
                error!(target: "registry", backend = %id, error = %msg, "health check panicked");
                ServiceHealth {
                    source_name: id,
                    healthy: false,
                    response_time_ms: Some(elapsed_ms),
                    error: Some(format!("health check panicked: {msg}")),
                    last_checked_at: Utc::now(),
                }
            }
            Err(_) => ServiceHealth {
                source_name: id,
                healthy: false,
                response_time_ms: Some(elapsed_ms),
                error: Some("health check timed out".to_string()),
                last_checked_at: Utc::now(),
            },
        }
    }

    pub async fn health_all(&self) -> Vec<ServiceHealth> {
        let clients = self.list();
        join_all(clients.iter().map(|c| self.health(c))).await
    }

    /// Backends whose (cached) health is good and that are still registered.
    pub async fn get_healthy(&self) -> Vec<DynBackend> {
        let clients = self.list();
        let health = join_all(clients.iter().map(|c| self.health(c))).await;
        clients
            .into_iter()
            .zip(health)
            .filter(|(c, h)| h.healthy && self.is_registered(c.id()))
            .map(|(c, _)| c)
            .collect()
    }

    pub async fn search_all(&self, query: &SearchQuery) -> Vec<BackendResult> {
        Self::search_clients(self.list(), query).await
    }

    pub async fn search_healthy(&self, query: &SearchQuery) -> Vec<BackendResult> {
        Self::search_clients(self.get_healthy().await, query).await
    }

    async fn search_clients(clients: Vec<DynBackend>, query: &SearchQuery) -> Vec<BackendResult> {
        let out = fan_out(clients, query, None).await;
        let mut results = out.completed;
        for id in out.pending {
            let err = ApiError::server_error(&id, "backend task did not complete");
            results.push(BackendResult::failed(id, err, None));
        }
        results
    }

    pub fn clear_health_cache(&self) {
        self.health_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn stats(&self) -> RegistryStats {
        let services = self.ids();
        let cache = self.health_cache.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh: Vec<&CachedHealth> = cache
            .values()
            .filter(|c| c.checked_at.elapsed() < self.health_ttl)
            .collect();
        let healthy = fresh.iter().filter(|c| c.health.healthy).count();
        RegistryStats {
            total_services: services.len(),
            healthy_services: healthy,
            unhealthy_services: fresh.len() - healthy,
            cached_health_entries: cache.len(),
            services,
        }
    }
}
