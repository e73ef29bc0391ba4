//! Scripted in-memory backend for tests and local demos.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendClient, HealthCheck};
use crate::error::{ApiError, ApiErrorKind};
use crate::types::{BackendResult, Coordinates, Opportunity, OpportunityType, SearchQuery};

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Succeed(Vec<Opportunity>),
    Fail(ApiError),
    /// Fail with `error` on the first `failures` calls, then succeed.
    FailTimes {
        failures: usize,
        error: ApiError,
        then: Vec<Opportunity>,
    },
    /// Panics inside `search`; exercises task-failure handling.
    Panic,
}

pub struct MockBackend {
    id: String,
    behavior: Mutex<MockBehavior>,
    delay: Duration,
    healthy: AtomicBool,
    health_delay: Duration,
    health_panics: bool,
    calls: AtomicUsize,
    health_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(id: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            id: id.into(),
            behavior: Mutex::new(behavior),
            delay: Duration::ZERO,
            healthy: AtomicBool::new(true),
            health_delay: Duration::ZERO,
            health_panics: false,
            calls: AtomicUsize::new(0),
            health_calls: AtomicUsize::new(0),
        }
    }

    /// Returns `count` generated opportunities on every call.
    pub fn succeeding(id: impl Into<String>, count: usize) -> Self {
        let id = id.into();
        let opps = (0..count).map(|i| sample_opportunity(&id, i)).collect();
        Self::new(id, MockBehavior::Succeed(opps))
    }

    pub fn failing(id: impl Into<String>, kind: ApiErrorKind) -> Self {
        let id = id.into();
        let err = ApiError::new(kind, id.clone(), format!("{} failure", kind.as_str()));
        Self::new(id, MockBehavior::Fail(err))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    /// Panics inside `health_check` after counting the call.
    pub fn with_health_panic(mut self) -> Self {
        self.health_panics = true;
        self
    }

    pub fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Number of `search` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn search(&self, query: &SearchQuery) -> BackendResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let ms = self.delay.as_millis() as u64;
        match self.behavior() {
            MockBehavior::Succeed(mut opps) => {
                opps.truncate(query.result_limit);
                BackendResult::ok(&self.id, opps, ms)
            }
            MockBehavior::Fail(e) => BackendResult::failed(&self.id, e, Some(ms)),
            MockBehavior::FailTimes {
                failures,
                error,
                then,
            } => {
                if n <= failures {
                    BackendResult::failed(&self.id, error, Some(ms))
                } else {
                    BackendResult::ok(&self.id, then, ms)
                }
            }
            MockBehavior::Panic => panic!("mock backend {} panicked", self.id),
        }
    }

    async fn get_details(&self, id: &str) -> Result<Opportunity, ApiError> {
        let found = match self.behavior() {
            MockBehavior::Succeed(opps) | MockBehavior::FailTimes { then: opps, .. } => {
                opps.into_iter().find(|o| o.id == id)
            }
            MockBehavior::Fail(e) => return Err(e),
            MockBehavior::Panic => None,
        };
        found.ok_or_else(|| {
            let mut e = ApiError::invalid_response(&self.id, format!("opportunity {id} not found"));
            e.status_code = Some(404);
            e
        })
    }

    async fn health_check(&self) -> HealthCheck {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        if self.health_panics {
            panic!("mock backend {} health check panicked", self.id);
        }
        let ms = self.health_delay.as_millis() as u64;
        if self.healthy.load(Ordering::SeqCst) {
            HealthCheck::healthy(ms)
        } else {
            HealthCheck::unhealthy("mock marked unhealthy", Some(ms))
        }
    }
}

/// Deterministic opportunity `"{source}-{i}"`.
pub fn sample_opportunity(source: &str, i: usize) -> Opportunity {
    Opportunity {
        id: format!("{source}-{i}"),
        source: source.to_string(),
        title: format!("Opportunity {i} from {source}"),
        organization: format!("{source} org"),
        description: "Help out in the community".to_string(),
        location: "Springfield".to_string(),
        city: "Springfield".to_string(),
        country: "US".to_string(),
        coordinates: Some(Coordinates::new(39.78, -89.65)),
        opportunity_type: OpportunityType::InPerson,
        cause: "community".to_string(),
        time_commitment: "2 hours".to_string(),
        date: "2026-01-01".to_string(),
        external_url: format!("https://example.org/{source}/{i}"),
        last_updated: "2026-01-01T00:00:00Z".to_string(),
        ..Default::default()
    }
}
