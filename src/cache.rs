//! # Result Cache
//! In-memory, TTL + capacity bounded store of merged search results, keyed by
//! the normalized query (see [`SearchQuery::cache_key`]).
//!
//! - TTL is absolute: an entry expires `ttl` after it was written, reads do
//!   not refresh it. Expired entries found by `get` are removed and count as
//!   a miss.
//! - Every `set` first drops all expired entries, then evicts the oldest entry
//!   by creation time until there is room.
//! - Hit/miss counters accumulate until `clear()`.
//!
//! The whole state sits behind one mutex. A poisoned lock is recovered rather
//! than propagated, so the cache can never fail a search.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::geo::haversine_km;
use crate::types::{Coordinates, Opportunity, SearchQuery, SearchType};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SIZE: usize = 100;

/// Entries closer than this to an invalidation point are dropped.
const INVALIDATE_RADIUS_KM: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub total_results: usize,
    pub sources: Vec<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub opportunities: Vec<Opportunity>,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    pub ttl: Duration,
    pub query: SearchQuery,
    pub metadata: CacheMetadata,
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// What a hit hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub opportunities: Vec<Opportunity>,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub max_size: usize,
    pub default_ttl_ms: u64,
}

/// Coarse bulk-eviction filter; an entry matching ANY set field is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InvalidationCriteria {
    pub location: Option<Coordinates>,
    pub radius_miles: Option<f64>,
    pub causes: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub search_type: Option<SearchType>,
}

impl InvalidationCriteria {
    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.radius_miles.is_none()
            && self.causes.is_none()
            && self.search_type.is_none()
    }

    fn matches(&self, q: &SearchQuery) -> bool {
        if let Some(loc) = &self.location {
            if haversine_km(loc, &q.coordinates) <= INVALIDATE_RADIUS_KM {
                return true;
            }
        }
        if let Some(r) = self.radius_miles {
            if r == q.radius_miles {
                return true;
            }
        }
        if let (Some(wanted), Some(have)) = (&self.causes, &q.causes) {
            let overlap = wanted
                .iter()
                .map(|c| c.trim().to_ascii_lowercase())
                .any(|c| have.iter().any(|h| h.eq_ignore_ascii_case(&c)));
            if overlap {
                return true;
            }
        }
        if let Some(t) = self.search_type {
            if t == q.search_type {
                return true;
            }
        }
        false
    }
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    default_ttl: Duration,
    max_size: usize,
    next_seq: u64,
}

impl CacheState {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .entries
            .values()
            .min_by_key(|e| (e.created_at, e.seq))
            .map(|e| e.key.clone());
        match oldest {
            Some(k) => {
                self.entries.remove(&k);
                true
            }
            None => false,
        }
    }

    fn shrink_to(&mut self, limit: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > limit && self.evict_oldest() {
            evicted += 1;
        }
        evicted
    }
}

#[derive(Debug)]
pub struct ResultCache {
    state: Mutex<CacheState>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_SIZE)
    }
}

impl ResultCache {
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                default_ttl,
                max_size: max_size.max(1),
                next_seq: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, query: &SearchQuery) -> Option<Vec<Opportunity>> {
        self.get_entry(query).map(|r| r.opportunities)
    }

    /// Lookup with metadata; expired entries are removed and count as a miss.
    pub fn get_entry(&self, query: &SearchQuery) -> Option<CachedResult> {
        let key = query.cache_key();
        let now = Instant::now();
        let mut st = self.lock();

        let expired = match st.entries.get(&key).map(|e| e.is_expired(now)) {
            None => {
                st.misses += 1;
                counter!("aggregator_cache_misses_total").increment(1);
                return None;
            }
            Some(expired) => expired,
        };

        if expired {
            st.entries.remove(&key);
            st.misses += 1;
            counter!("aggregator_cache_misses_total").increment(1);
            gauge!("aggregator_cache_entries").set(st.entries.len() as f64);
            debug!(target: "cache", %key, "expired entry evicted on read");
            return None;
        }

        st.hits += 1;
        counter!("aggregator_cache_hits_total").increment(1);
        st.entries.get(&key).map(|e| CachedResult {
            opportunities: e.opportunities.clone(),
            metadata: e.metadata.clone(),
        })
    }

    /// Store a result. `ttl = None` uses the default TTL.
    pub fn set(
        &self,
        query: &SearchQuery,
        opportunities: Vec<Opportunity>,
        metadata: CacheMetadata,
        ttl: Option<Duration>,
    ) {
        let key = query.cache_key();
        let now = Instant::now();
        let mut st = self.lock();

        let expired = st.purge_expired(now);
        st.entries.remove(&key);
        let mut evicted = 0usize;
        while st.entries.len() >= st.max_size && st.evict_oldest() {
            evicted += 1;
        }
        if expired + evicted > 0 {
            counter!("aggregator_cache_evictions_total").increment((expired + evicted) as u64);
            debug!(target: "cache", expired, evicted, "cache entries evicted");
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        let ttl = ttl.unwrap_or(st.default_ttl);
        st.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                opportunities,
                created_at: now,
                created_at_utc: Utc::now(),
                ttl,
                query: query.normalized(),
                metadata,
                seq,
            },
        );
        gauge!("aggregator_cache_entries").set(st.entries.len() as f64);
    }

    /// Present and not expired. Does not touch hit/miss counters.
    pub fn has(&self, query: &SearchQuery) -> bool {
        let key = query.cache_key();
        let now = Instant::now();
        self.lock()
            .entries
            .get(&key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Remove every entry matching any field of `criteria`. Empty criteria
    /// remove nothing; use [`ResultCache::clear`] to drop everything.
    pub fn invalidate(&self, criteria: &InvalidationCriteria) -> usize {
        if criteria.is_empty() {
            return 0;
        }
        let mut st = self.lock();
        let before = st.entries.len();
        st.entries.retain(|_, e| !criteria.matches(&e.query));
        let removed = before - st.entries.len();
        gauge!("aggregator_cache_entries").set(st.entries.len() as f64);
        debug!(target: "cache", removed, "cache invalidated");
        removed
    }

    /// Drop all entries and reset the hit/miss counters.
    pub fn clear(&self) {
        let mut st = self.lock();
        st.entries.clear();
        st.hits = 0;
        st.misses = 0;
        gauge!("aggregator_cache_entries").set(0.0);
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.lock();
        let lookups = st.hits + st.misses;
        let hit_rate = if lookups > 0 {
            st.hits as f64 / lookups as f64
        } else {
            0.0
        };
        CacheStats {
            total_entries: st.entries.len(),
            hit_count: st.hits,
            miss_count: st.misses,
            hit_rate,
            oldest_entry: st.entries.values().map(|e| e.created_at_utc).min(),
            newest_entry: st.entries.values().map(|e| e.created_at_utc).max(),
            max_size: st.max_size,
            default_ttl_ms: st.default_ttl.as_millis() as u64,
        }
    }

    pub fn set_default_ttl(&self, ttl: Duration) {
        self.lock().default_ttl = ttl;
    }

    /// Shrinks immediately if the cache is over the new bound.
    pub fn set_max_size(&self, max_size: usize) {
        let mut st = self.lock();
        st.max_size = max_size.max(1);
        let limit = st.max_size;
        let evicted = st.shrink_to(limit);
        if evicted > 0 {
            counter!("aggregator_cache_evictions_total").increment(evicted as u64);
        }
    }
}
