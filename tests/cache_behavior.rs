// tests/cache_behavior.rs
//
// Result cache: key stability, absolute TTL, capacity bound, invalidation.

use std::time::Duration;

use rand::Rng;
use volunteer_search_aggregator::backend::mock::sample_opportunity;
use volunteer_search_aggregator::cache::{CacheMetadata, InvalidationCriteria, ResultCache};
use volunteer_search_aggregator::types::{Coordinates, SearchQuery, SearchType};

fn query(lat: f64, lng: f64) -> SearchQuery {
    SearchQuery::new(Coordinates::new(lat, lng), 25.0)
}

fn meta() -> CacheMetadata {
    CacheMetadata {
        total_results: 1,
        sources: vec!["alpha".into()],
        response_time_ms: 12,
    }
}

#[test]
fn jittered_coordinates_and_reordered_causes_hit_the_same_entry() {
    let cache = ResultCache::default();
    let base = query(40.7128, -74.0060).with_causes(["environment", "education", "health"]);
    cache.set(&base, vec![sample_opportunity("alpha", 0)], meta(), None);

    let mut rng = rand::rng();
    for _ in 0..50 {
        // stays inside the same 3-decimal bucket as the base point
        let dlat: f64 = rng.random_range(-0.0002..0.0002);
        let dlng: f64 = rng.random_range(-0.0002..0.0002);
        let q = query(40.7128 + dlat, -74.0060 + dlng)
            .with_causes(["Health", "environment", " education"]);
        let hit = cache.get(&q).expect("jittered query should hit");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].id, "alpha-0");
    }
    assert_eq!(cache.stats().hit_count, 50);
}

#[test]
fn other_filters_produce_distinct_keys() {
    let cache = ResultCache::default();
    let q = query(10.0, 10.0);
    cache.set(&q, vec![sample_opportunity("alpha", 0)], meta(), None);

    assert!(cache.get(&q.clone().with_type(SearchType::Virtual)).is_none());
    assert!(cache.get(&q.clone().with_limit(5)).is_none());
    assert!(cache.get(&q.clone().with_causes(["animals"])).is_none());
    let mut wider = q.clone();
    wider.radius_miles = 50.0;
    assert!(cache.get(&wider).is_none());
}

#[tokio::test(start_paused = true)]
async fn entry_expires_after_its_ttl_and_counts_a_miss() {
    let cache = ResultCache::default();
    let q = query(1.0, 1.0);
    cache.set(
        &q,
        vec![sample_opportunity("alpha", 0)],
        meta(),
        Some(Duration::from_millis(100)),
    );
    assert!(cache.has(&q));

    tokio::time::advance(Duration::from_millis(150)).await;

    assert!(cache.get(&q).is_none(), "expired entry must miss");
    let s = cache.stats();
    assert_eq!(s.total_entries, 0, "expired entry must be removed");
    assert_eq!(s.miss_count, 1);
}

#[tokio::test(start_paused = true)]
async fn reads_do_not_refresh_ttl() {
    let cache = ResultCache::new(Duration::from_millis(200), 10);
    let q = query(2.0, 2.0);
    cache.set(&q, vec![], meta(), None);

    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(cache.get(&q).is_some());
    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(cache.get(&q).is_none());
}

#[tokio::test(start_paused = true)]
async fn oldest_entry_is_evicted_at_capacity() {
    let cache = ResultCache::new(Duration::from_secs(300), 3);
    for i in 0..3 {
        cache.set(&query(i as f64, 0.0), vec![], meta(), None);
        tokio::time::advance(Duration::from_millis(10)).await;
    }
    cache.set(&query(9.0, 0.0), vec![], meta(), None);

    let s = cache.stats();
    assert!(s.total_entries <= 3);
    assert!(!cache.has(&query(0.0, 0.0)), "first insert should be evicted");
    assert!(cache.has(&query(1.0, 0.0)));
    assert!(cache.has(&query(2.0, 0.0)));
    assert!(cache.has(&query(9.0, 0.0)));
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_purged_before_evicting_live_ones() {
    let cache = ResultCache::new(Duration::from_secs(300), 2);
    cache.set(&query(0.0, 0.0), vec![], meta(), None);
    cache.set(&query(1.0, 0.0), vec![], meta(), Some(Duration::from_millis(50)));
    tokio::time::advance(Duration::from_millis(60)).await;

    cache.set(&query(2.0, 0.0), vec![], meta(), None);
    assert!(cache.has(&query(0.0, 0.0)), "live entry survives");
    assert!(cache.has(&query(2.0, 0.0)));
    assert_eq!(cache.stats().total_entries, 2);
}

#[test]
fn invalidate_matches_any_criterion() {
    let cache = ResultCache::default();
    let nyc = query(40.7128, -74.0060).with_causes(["environment"]);
    let la = query(34.0522, -118.2437).with_causes(["education"]);
    let virt = query(51.5, -0.12).with_type(SearchType::Virtual);
    for q in [&nyc, &la, &virt] {
        cache.set(q, vec![], meta(), None);
    }

    let removed = cache.invalidate(&InvalidationCriteria {
        location: Some(Coordinates::new(40.7129, -74.0061)),
        ..Default::default()
    });
    assert_eq!(removed, 1);
    assert!(!cache.has(&nyc));

    let removed = cache.invalidate(&InvalidationCriteria {
        causes: Some(vec!["Education".into()]),
        search_type: Some(SearchType::Virtual),
        ..Default::default()
    });
    assert_eq!(removed, 2);
    assert_eq!(cache.stats().total_entries, 0);
}

#[test]
fn clear_drops_entries_and_resets_counters() {
    let cache = ResultCache::default();
    let q = query(3.0, 3.0);
    cache.set(&q, vec![], meta(), None);
    let _ = cache.get(&q);
    let _ = cache.get(&query(4.0, 4.0));

    cache.clear();
    let s = cache.stats();
    assert_eq!(s.total_entries, 0);
    assert_eq!((s.hit_count, s.miss_count), (0, 0));
    assert_eq!(s.hit_rate, 0.0);
    assert!(s.oldest_entry.is_none());
}
