// tests/registry.rs
//
// Service registry: membership, TTL-cached health, probe timeouts.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use volunteer_search_aggregator::backend::{DynBackend, MockBackend};
use volunteer_search_aggregator::cache::ResultCache;
use volunteer_search_aggregator::engine::SearchController;
use volunteer_search_aggregator::error::ApiErrorKind;
use volunteer_search_aggregator::registry::ServiceRegistry;
use volunteer_search_aggregator::types::{Coordinates, SearchOptions, SearchQuery};

fn registry() -> ServiceRegistry {
    ServiceRegistry::new(Duration::from_secs(60), Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn health_is_cached_for_its_ttl() {
    let reg = registry();
    let a = Arc::new(MockBackend::succeeding("alpha", 1));
    reg.register(a.clone());
    let dyn_a: DynBackend = a.clone();

    assert!(reg.health(&dyn_a).await.healthy);
    assert!(reg.health(&dyn_a).await.healthy);
    assert_eq!(a.health_calls(), 1);

    a.set_healthy(false);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(reg.health(&dyn_a).await.healthy, "still cached");

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!reg.health(&dyn_a).await.healthy, "re-probed after ttl");
    assert_eq!(a.health_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_probe_is_reported_unhealthy() {
    let reg = registry();
    let slow = Arc::new(
        MockBackend::succeeding("slow", 1).with_health_delay(Duration::from_secs(30)),
    );
    reg.register(slow);

    let all = reg.health_all().await;
    assert_eq!(all.len(), 1);
    assert!(!all[0].healthy);
    assert_eq!(all[0].error.as_deref(), Some("health check timed out"));
    assert!(reg.get_healthy().await.is_empty());
}

#[tokio::test]
async fn panicking_probe_is_reported_unhealthy() {
    let reg = Arc::new(registry());
    let good = Arc::new(MockBackend::succeeding("alpha", 2));
    let broken = Arc::new(MockBackend::succeeding("broken", 2).with_health_panic());
    reg.register(good.clone());
    reg.register(broken.clone());

    let dyn_broken: DynBackend = broken.clone();
    let h = reg.health(&dyn_broken).await;
    assert!(!h.healthy);
    assert!(h.error.as_deref().unwrap_or_default().contains("panicked"));

    reg.clear_health_cache();
    let ctl = SearchController::new(reg, Arc::new(ResultCache::default()));
    let result = tokio::spawn(async move {
        ctl.search(
            &SearchQuery::new(Coordinates::new(40.0, -74.0), 10.0),
            SearchOptions::default(),
        )
        .await
    })
    .await
    .expect("search task must not panic")
    .unwrap();

    assert_eq!(result.total_count, 2);
    assert_eq!(result.sources, vec!["alpha".to_string()]);
    assert_eq!(broken.calls(), 0, "unhealthy backend is skipped");
    assert_eq!(broken.health_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_stale_lookups_share_one_probe() {
    let reg = registry();
    let slow = Arc::new(
        MockBackend::succeeding("slow", 1).with_health_delay(Duration::from_millis(200)),
    );
    reg.register(slow.clone());
    let dyn_slow: DynBackend = slow.clone();

    let all = join_all((0..6).map(|_| reg.health(&dyn_slow))).await;
    assert!(all.iter().all(|h| h.healthy));
    assert_eq!(slow.health_calls(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    join_all((0..6).map(|_| reg.health(&dyn_slow))).await;
    assert_eq!(slow.health_calls(), 2, "one re-probe once stale");
}

#[tokio::test]
async fn register_replaces_same_id_and_unregister_removes() {
    let reg = registry();
    reg.register(Arc::new(MockBackend::succeeding("alpha", 1)));
    reg.register(Arc::new(MockBackend::succeeding("beta", 1)));
    reg.register(Arc::new(MockBackend::succeeding("alpha", 5)));
    assert_eq!(reg.ids(), vec!["alpha".to_string(), "beta".to_string()]);

    let results = reg.search_all(&SearchQuery::new(Coordinates::new(0.0, 0.0), 5.0)).await;
    let alpha = results.iter().find(|r| r.source_name == "alpha").unwrap();
    assert_eq!(alpha.opportunities.len(), 5, "replacement is the one searched");

    assert!(reg.unregister("alpha"));
    assert!(!reg.unregister("alpha"));
    assert!(reg.get("alpha").is_none());
    assert_eq!(reg.list().len(), 1);
}

#[tokio::test]
async fn get_healthy_filters_and_search_healthy_skips_unhealthy() {
    let reg = registry();
    let a = Arc::new(MockBackend::succeeding("alpha", 1));
    let b = Arc::new(MockBackend::succeeding("beta", 1).unhealthy());
    let c = Arc::new(MockBackend::failing("gamma", ApiErrorKind::ServerError));
    reg.register(a);
    reg.register(b.clone());
    reg.register(c);

    let healthy: Vec<_> = reg
        .get_healthy()
        .await
        .iter()
        .map(|c| c.id().to_string())
        .collect();
    assert_eq!(healthy, vec!["alpha".to_string(), "gamma".to_string()]);

    let results = reg
        .search_healthy(&SearchQuery::new(Coordinates::new(0.0, 0.0), 5.0))
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(b.calls(), 0);
    let gamma = results.iter().find(|r| r.source_name == "gamma").unwrap();
    assert!(!gamma.success);

    let stats = reg.stats();
    assert_eq!(stats.total_services, 3);
    assert_eq!(stats.healthy_services, 2);
    assert_eq!(stats.unhealthy_services, 1);
    assert_eq!(stats.cached_health_entries, 3);

    reg.clear_health_cache();
    assert_eq!(reg.stats().cached_health_entries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_health_lookups_are_consistent() {
    let reg = Arc::new(registry());
    for i in 0..8 {
        reg.register(Arc::new(MockBackend::succeeding(format!("b{i}"), 1)));
    }

    let mut handles = Vec::new();
    for _ in 0..16 {
        let r = reg.clone();
        handles.push(tokio::spawn(async move { r.get_healthy().await.len() }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap(), 8);
    }
    assert_eq!(reg.stats().cached_health_entries, 8);
}
