//! Integration tests for the routing, caching and memory-pressure core
//!
//! These tests drive the public API end to end with the mock collaborators
//! from `router_core::test_utils`. Tests cover:
//! - Concurrent identical requests sharing one backend call
//! - Circuit breakers opening, probing and closing through `Router::submit`
//! - Memory pressure cleanup and instantaneous pressure checks
//! - Cost-aware cache TTL and eviction ordering
//! - Constraint filtering that never reaches a backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use router_core::backend::{InMemoryStore, PersistentStore, StoreError};
use router_core::cache::entry::ttl_for_cost;
use router_core::cache::{
    CacheKey, CacheTier, EntryMeta, InsertOutcome, MultiTierCache, TierKind, TierLookup, TierPolicy,
};
use router_core::config::{CacheConfig, MemoryConfig};
use router_core::memory::{MemoryManager, PressureState};
use router_core::test_utils::{descriptor, standard_models, MockInvoker, MockLifecycle, MockPressureTarget};
use router_core::{
    CircuitState, EventBus, InferenceRequest, Router, RouterConfig, RouterError, RouterEvent,
    RoutingError, SelectionStrategy,
};

fn router_with(invoker: Arc<MockInvoker>) -> Router {
    let config = RouterConfig {
        models: standard_models(),
        ..RouterConfig::default()
    };
    Router::builder(config, invoker).build().unwrap()
}

fn memory_config(budget_bytes: u64) -> MemoryConfig {
    MemoryConfig {
        budget_bytes,
        ..MemoryConfig::default()
    }
}

// =============================================================================
// Test 1: Concurrent Identical Requests Share One Call
// =============================================================================

/// Two identical requests submitted while the first is in flight produce a
/// single backend call, and both callers get the same text.
#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_requests_share_one_call() {
    let invoker = Arc::new(MockInvoker::new().with_delay(Duration::from_millis(50)));
    let router = router_with(invoker.clone());

    let first = InferenceRequest::new("Explain TCP").with_model("m1");
    let second = InferenceRequest::new("Explain TCP").with_model("m1");
    let (a, b) = tokio::join!(router.submit(first), router.submit(second));

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.text, b.text);
    assert_eq!(a.model_id, "m1");
    assert_eq!(invoker.call_count("m1"), 1);
    assert_eq!(invoker.total_calls(), 1);

    let stats = router.stats();
    assert_eq!(stats.dedup_joins, 1);
    assert_eq!(stats.cache_misses, 1);
}

/// Many concurrent callers still make one call per distinct key.
#[tokio::test(start_paused = true)]
async fn test_dedup_is_per_key() {
    let invoker = Arc::new(MockInvoker::new().with_delay(Duration::from_millis(20)));
    let router = Arc::new(router_with(invoker.clone()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let router = Arc::clone(&router);
        let prompt = if i % 2 == 0 { "even" } else { "odd" };
        handles.push(tokio::spawn(async move {
            router.submit(InferenceRequest::new(prompt)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let prompts: Vec<String> = invoker.calls().into_iter().map(|c| c.prompt).collect();
    assert_eq!(prompts.len(), 2);
    assert!(prompts.contains(&"even".to_string()));
    assert!(prompts.contains(&"odd".to_string()));
}

/// A caller that gives up does not cancel the shared call; its result still
/// lands in the cache.
#[tokio::test(start_paused = true)]
async fn test_detached_caller_still_fills_cache() {
    let invoker = Arc::new(MockInvoker::new().with_delay(Duration::from_millis(100)));
    let router = router_with(invoker.clone());

    let gave_up = tokio::time::timeout(
        Duration::from_millis(10),
        router.submit(InferenceRequest::new("patience")),
    )
    .await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let response = router.submit(InferenceRequest::new("patience")).await.unwrap();
    assert!(response.served_from.is_some());
    assert_eq!(invoker.total_calls(), 1);
}

/// Store whose reads return what was stored when the read began, after a delay
struct SlowReadStore {
    inner: InMemoryStore,
    read_delay: Duration,
}

#[async_trait]
impl PersistentStore for SlowReadStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshot = self.inner.read(key).await;
        tokio::time::sleep(self.read_delay).await;
        snapshot
    }

    async fn write(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.inner.write(key, bytes, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// A second caller whose Cold read starts before the first call's result is
/// written, and whose claim lands after that call completed, is served from
/// the Cold tier instead of calling the backend again.
#[tokio::test(start_paused = true)]
async fn test_slow_cold_read_does_not_repeat_call() {
    let invoker = Arc::new(MockInvoker::new().with_delay(Duration::from_millis(50)));
    let store = Arc::new(SlowReadStore {
        inner: InMemoryStore::new(),
        read_delay: Duration::from_millis(100),
    });
    let config = RouterConfig {
        models: standard_models(),
        ..RouterConfig::default()
    };
    let router = Arc::new(
        Router::builder(config, invoker.clone())
            .store(store as Arc<dyn PersistentStore>)
            .build()
            .unwrap(),
    );

    // Reads at 0ms and 100ms miss; the call runs 200ms..250ms
    let first = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            router
                .submit(InferenceRequest::new("Explain TCP").with_model("m1"))
                .await
        })
    };
    // Cold read starts at 210ms, before the write; the claim lands at 310ms
    tokio::time::sleep(Duration::from_millis(210)).await;
    let second = router
        .submit(InferenceRequest::new("Explain TCP").with_model("m1"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(invoker.total_calls(), 1);
    assert_eq!(first.served_from, None);
    assert_eq!(second.served_from, Some(TierKind::Cold));
    assert_eq!(second.text, first.text);
}

// =============================================================================
// Test 2: Circuit Opens, Probes and Closes
// =============================================================================

/// m1 fails five times, its circuit opens and traffic moves to m2; after the
/// open timeout three successful probes close the circuit again.
#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_recovers() {
    let invoker = Arc::new(MockInvoker::new());
    invoker.fail_always("m1");
    let router = router_with(invoker.clone());

    for i in 0..5 {
        let response = router
            .submit(InferenceRequest::new(format!("warmup {i}")))
            .await
            .unwrap();
        assert_eq!(response.model_id, "m2");
    }
    assert_eq!(invoker.call_count("m1"), 5);
    assert_eq!(router.circuits().state("m1"), CircuitState::Open);

    // Still open at 59s: m1 is not even attempted
    tokio::time::advance(Duration::from_secs(59)).await;
    let response = router.submit(InferenceRequest::new("during outage")).await.unwrap();
    assert_eq!(response.model_id, "m2");
    assert_eq!(response.fallback_depth, 0);
    assert_eq!(invoker.call_count("m1"), 5);

    tokio::time::advance(Duration::from_secs(2)).await;
    invoker.recover("m1");
    assert_eq!(router.circuits().state("m1"), CircuitState::HalfOpen);

    for i in 0..3 {
        let response = router
            .submit(InferenceRequest::new(format!("probe {i}")))
            .await
            .unwrap();
        assert_eq!(response.model_id, "m1");
    }
    assert_eq!(router.circuits().state("m1"), CircuitState::Closed);
}

/// An open circuit publishes its transitions on the event bus.
#[tokio::test(start_paused = true)]
async fn test_circuit_transitions_are_published() {
    let invoker = Arc::new(MockInvoker::new());
    invoker.fail_always("m1");
    let router = router_with(invoker);
    let mut events = router.subscribe();

    for i in 0..5 {
        router
            .submit(InferenceRequest::new(format!("req {i}")))
            .await
            .unwrap();
    }

    let mut opened = false;
    while let Ok(event) = events.try_recv() {
        if let RouterEvent::CircuitStateChanged { model_id, from, to } = event {
            assert_eq!(model_id, "m1");
            assert_eq!((from, to), (CircuitState::Closed, CircuitState::Open));
            opened = true;
        }
    }
    assert!(opened);
}

// =============================================================================
// Test 3: Critical Pressure Cleanup
// =============================================================================

/// At 0.92 utilization the Critical handler evicts 30% of the cache and
/// unloads the least recently used unpinned model; the next check sees the
/// lower utilization.
#[tokio::test(start_paused = true)]
async fn test_critical_pressure_cleanup() {
    let cache = Arc::new(MockPressureTarget::new(520));
    let lifecycle = Arc::new(MockLifecycle::new());
    let manager = MemoryManager::new(memory_config(1000))
        .with_cache(cache.clone())
        .with_lifecycle(lifecycle.clone());

    manager.ensure_model_resident("old", 200).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.ensure_model_resident("new", 200).await.unwrap();

    assert_eq!(manager.check_pressure(), PressureState::Critical);
    assert!((manager.utilization() - 0.92).abs() < 1e-9);

    let after = manager.relieve_pressure().await;
    assert_eq!(cache.fractions(), vec![0.30]);
    assert_eq!(lifecycle.unloaded(), vec!["old".to_string()]);
    assert_eq!(cache.resident(), 364);
    assert_eq!(after, PressureState::Normal);
    assert_eq!(manager.check_pressure(), PressureState::Normal);
    assert!(manager.utilization() < 0.75);
}

/// Pinned models survive Critical cleanup.
#[tokio::test(start_paused = true)]
async fn test_critical_cleanup_skips_pinned_models() {
    let cache = Arc::new(MockPressureTarget::new(520));
    let lifecycle = Arc::new(MockLifecycle::new().with_pinned(["old"]));
    let manager = MemoryManager::new(memory_config(1000))
        .with_cache(cache)
        .with_lifecycle(lifecycle.clone());

    manager.ensure_model_resident("old", 200).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.ensure_model_resident("new", 200).await.unwrap();

    manager.relieve_pressure().await;
    assert_eq!(lifecycle.unloaded(), vec!["new".to_string()]);
}

// =============================================================================
// Test 4: Cost-Aware TTL and Eviction Order
// =============================================================================

/// An expensive entry outlives a cheap one, and under capacity pressure the
/// cheap one is evicted first.
#[tokio::test(start_paused = true)]
async fn test_expensive_entry_outranks_cheap_entry() {
    let config = CacheConfig::default();
    let ttl_a = ttl_for_cost(0.08, &config);
    let ttl_b = ttl_for_cost(0.001, &config);
    assert!(ttl_a > ttl_b);

    let mut tier: CacheTier<Vec<u8>> = CacheTier::new(TierPolicy {
        kind: TierKind::Hot,
        budget_bytes: 200,
        admission_floor: 0.0,
        age_weight: config.age_weight,
    });
    let key_a = CacheKey::from_hex("aa");
    let key_b = CacheKey::from_hex("bb");
    let now = Instant::now();
    tier.insert(key_a.clone(), vec![0; 100], EntryMeta::new(0.08, 0.9, ttl_a, 100, now), now);
    tier.insert(key_b.clone(), vec![0; 100], EntryMeta::new(0.001, 0.9, ttl_b, 100, now), now);

    // Both accessed once
    assert!(matches!(tier.lookup(&key_a, now), TierLookup::Hit(..)));
    assert!(matches!(tier.lookup(&key_b, now), TierLookup::Hit(..)));

    tokio::time::advance(Duration::from_secs(3600)).await;
    let later = Instant::now();
    let a = tier.peek(&key_a).unwrap().effectiveness(later, config.age_weight);
    let b = tier.peek(&key_b).unwrap().effectiveness(later, config.age_weight);
    assert!(a > b, "expected {a} > {b}");

    let key_c = CacheKey::from_hex("cc");
    let outcome = tier.insert(
        key_c.clone(),
        vec![0; 100],
        EntryMeta::new(0.01, 0.9, ttl_b, 100, later),
        later,
    );
    let InsertOutcome::Inserted { evicted } = outcome else {
        panic!("insert must fit after eviction");
    };
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].key, key_b);
    assert!(tier.contains(&key_a));
    assert!(tier.contains(&key_c));
}

// =============================================================================
// Test 5: Constraints That Rule Out Every Model
// =============================================================================

/// A quality threshold above every candidate fails fast with no backend call.
#[tokio::test]
async fn test_quality_threshold_rules_out_all_models() {
    let invoker = Arc::new(MockInvoker::new());
    let config = RouterConfig {
        models: vec![
            descriptor("a", 0.8, 0.000_01, 100),
            descriptor("b", 0.8, 0.000_02, 200),
        ],
        ..RouterConfig::default()
    };
    let router = Router::builder(config, invoker.clone()).build().unwrap();

    let err = router
        .submit(InferenceRequest::new("hello").with_quality_threshold(0.95))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::Routing(RoutingError::NoViableModel { .. })
    ));
    assert_eq!(invoker.total_calls(), 0);
    assert_eq!(router.stats().routing_errors, 1);
}

/// A budget below every candidate's estimated cost fails fast with no call.
#[tokio::test]
async fn test_budget_limit_rules_out_all_models() {
    let invoker = Arc::new(MockInvoker::new());
    let router = router_with(invoker.clone());

    let err = router
        .submit(InferenceRequest::new("hello").with_budget_limit(1e-9))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::Routing(RoutingError::NoViableModel { .. })
    ));
    assert_eq!(invoker.total_calls(), 0);
}

/// A latency ceiling keeps only the fast model.
#[tokio::test]
async fn test_latency_ceiling_filters_slow_models() {
    let invoker = Arc::new(MockInvoker::new());
    let router = router_with(invoker.clone());

    let response = router
        .submit(
            InferenceRequest::new("hello")
                .with_model("m3")
                .with_max_latency_ms(250),
        )
        .await
        .unwrap();
    assert_eq!(response.model_id, "m1");
}

// =============================================================================
// Cache Properties
// =============================================================================

fn cache() -> MultiTierCache<String> {
    MultiTierCache::new(
        CacheConfig::default(),
        Arc::new(InMemoryStore::new()),
        EventBus::default(),
    )
}

fn key(prompt: &str) -> CacheKey {
    CacheKey::for_request(&InferenceRequest::new(prompt), SelectionStrategy::Balanced)
}

/// `set` followed by `get` returns the payload unchanged.
#[tokio::test]
async fn test_cache_round_trip() {
    let cache = cache();
    let payload = "a response long enough to be worth keeping ".repeat(200);

    cache.set(&key("tcp"), payload.as_bytes(), 0.05, 0.9).await;
    let hit = cache.get(&key("tcp")).await.unwrap();
    assert_eq!(hit.payload, payload.as_bytes());
    assert_eq!(hit.tier, TierKind::Hot);
}

/// Cheap entries still round-trip through the Cold tier.
#[tokio::test]
async fn test_cheap_entry_round_trips_through_cold() {
    let cache = cache();
    cache.set(&key("cheap"), b"tiny", 0.000_01, 0.5).await;

    assert!(!cache.tier_contains(TierKind::Hot, &key("cheap")));
    let hit = cache.get(&key("cheap")).await.unwrap();
    assert_eq!(hit.payload, b"tiny".to_vec());
    assert_eq!(hit.tier, TierKind::Cold);
}

/// `evict(tier, n)` frees at least `n` bytes or leaves the tier empty.
#[tokio::test]
async fn test_eviction_frees_requested_bytes() {
    let cache = cache();
    for i in 0..5 {
        cache
            .set(&key(&format!("entry {i}")), &[b'x'; 100], 1.0, 0.9)
            .await;
    }
    let before = cache.tier_bytes(TierKind::Hot);
    assert_eq!(before, 500);

    let freed = cache.evict(TierKind::Hot, 250).await;
    assert!(freed >= 250);
    assert_eq!(cache.tier_bytes(TierKind::Hot), before - freed);

    let freed = cache.evict(TierKind::Hot, 10_000).await;
    assert!(freed < 10_000);
    assert_eq!(cache.tier_bytes(TierKind::Hot), 0);
    // Lower tiers keep their copies
    assert!(cache.tier_bytes(TierKind::Warm) > 0);
}

// =============================================================================
// Pressure Correctness
// =============================================================================

/// A jump from 0.60 to 0.96 is reported as Emergency on the next check,
/// without passing through Warning or Critical.
#[tokio::test]
async fn test_pressure_jump_reports_emergency_directly() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let cache = Arc::new(MockPressureTarget::new(600));
    let manager = MemoryManager::new(memory_config(1000))
        .with_cache(cache.clone())
        .with_events(events);

    assert_eq!(manager.check_pressure(), PressureState::Normal);
    cache.set_resident(960);
    assert_eq!(manager.check_pressure(), PressureState::Emergency);

    let RouterEvent::PressureChanged { from, to, alert, .. } = rx.try_recv().unwrap() else {
        panic!("expected a pressure event");
    };
    assert_eq!((from, to), (PressureState::Normal, PressureState::Emergency));
    assert!(alert);
    assert!(rx.try_recv().is_err());
}

/// Emergency cleanup clears the cache and unloads every unpinned model.
#[tokio::test]
async fn test_emergency_cleanup_clears_everything() {
    let cache = Arc::new(MockPressureTarget::new(700));
    let lifecycle = Arc::new(MockLifecycle::new().with_pinned(["essential"]));
    let manager = MemoryManager::new(memory_config(1000))
        .with_cache(cache.clone())
        .with_lifecycle(lifecycle.clone());
    manager.ensure_model_resident("essential", 100).await.unwrap();
    manager.ensure_model_resident("extra", 160).await.unwrap();

    assert_eq!(manager.check_pressure(), PressureState::Emergency);
    let after = manager.relieve_pressure().await;

    assert_eq!(cache.resident(), 0);
    assert_eq!(lifecycle.unloaded(), vec!["extra".to_string()]);
    assert_eq!(after, PressureState::Normal);
}
