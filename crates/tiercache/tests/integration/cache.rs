use std::sync::Arc;
use std::time::Duration;

use tiercache::{CacheConfig, CacheError, MemoryStore, Store, TieredCache};
use tiercache_test::{FaultyStore, cache_with, setup};

#[tokio::test(start_paused = true)]
async fn test_set_then_get() {
    setup();

    let first = FaultyStore::<u32>::new("first");
    let second = FaultyStore::<u32>::new("second");
    let cache = cache_with(CacheConfig::default(), &[first.clone(), second.clone()]);

    assert_eq!(cache.get("key").await, None);
    assert_eq!(cache.set("key", 42, None).await.unwrap(), 42);
    assert_eq!(cache.get("key").await, Some(42));

    // the value is written to every tier
    assert_eq!(first.peek("key").await.unwrap().value, 42);
    assert_eq!(second.peek("key").await.unwrap().value, 42);
}

#[tokio::test(start_paused = true)]
async fn test_set_uses_default_ttl() {
    setup();

    let config = CacheConfig {
        ttl: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let store = FaultyStore::<u32>::new("memory");
    let cache = cache_with(config, &[store.clone()]);

    cache.set("default", 1, None).await.unwrap();
    cache.set("explicit", 2, Some(Duration::from_secs(5))).await.unwrap();

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(cache.get("default").await, None);
    assert_eq!(cache.get("explicit").await, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_get_skips_failing_tiers() {
    setup();

    let first = FaultyStore::<u32>::new("first");
    let second = FaultyStore::<u32>::new("second");
    let cache = cache_with(CacheConfig::default(), &[first.clone(), second.clone()]);

    cache.set("key", 1, None).await.unwrap();
    first.fail_reads(true);
    assert_eq!(cache.get("key").await, Some(1));
    assert_eq!(second.reads(), 1);

    second.fail_reads(true);
    assert_eq!(cache.get("key").await, None);
    assert_eq!(cache.get("missing").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_get_stops_at_first_hit() {
    setup();

    let first = FaultyStore::<u32>::new("first");
    let second = FaultyStore::<u32>::new("second");
    let cache = cache_with(CacheConfig::default(), &[first.clone(), second.clone()]);

    first.set("key", 1, None).await.unwrap();
    second.set("key", 2, None).await.unwrap();

    assert_eq!(cache.get("key").await, Some(1));
    assert_eq!(second.reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_and_clear() {
    setup();

    let first = FaultyStore::<u32>::new("first");
    let second = FaultyStore::<u32>::new("second");
    let cache = cache_with(CacheConfig::default(), &[first.clone(), second.clone()]);

    for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
        cache.set(key, value, None).await.unwrap();
    }

    assert!(cache.delete("a").await.unwrap());
    assert_eq!(cache.get("a").await, None);
    assert_eq!(cache.get("b").await, Some(2));
    assert!(first.peek("a").await.is_none());
    assert!(second.peek("a").await.is_none());

    assert!(cache.clear().await.unwrap());
    assert_eq!(cache.get("b").await, None);
    assert_eq!(cache.get("c").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_partial_set_failure() {
    setup();

    let local = FaultyStore::<u32>::new("local");
    let remote = FaultyStore::<u32>::new("remote");
    let cache = cache_with(CacheConfig::default(), &[local.clone(), remote.clone()]);

    remote.fail_writes(true);
    let err = cache.set("key", 1, None).await.unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"1 store(s) failed: tier 1 (remote): store unavailable: remote is down");

    let CacheError::Store(aggregate) = err else {
        panic!("expected a store error");
    };
    assert_eq!(aggregate.errors.len(), 1);
    assert_eq!(aggregate.errors[0].tier, 1);

    // nothing is rolled back
    assert_eq!(cache.get("key").await, Some(1));
    assert_eq!(remote.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_delete_and_clear_failure() {
    setup();

    let local = FaultyStore::<u32>::new("local");
    let remote = FaultyStore::<u32>::new("remote");
    let cache = cache_with(CacheConfig::default(), &[local.clone(), remote.clone()]);

    cache.set("key", 1, None).await.unwrap();
    remote.fail_writes(true);

    assert!(matches!(
        cache.delete("key").await,
        Err(CacheError::Store(_))
    ));
    assert!(local.peek("key").await.is_none());
    assert_eq!(remote.peek("key").await.unwrap().value, 1);

    assert!(matches!(cache.clear().await, Err(CacheError::Store(_))));
}

#[tokio::test]
async fn test_requires_stores() {
    let result = TieredCache::<u32>::new(vec![], CacheConfig::default());
    assert!(matches!(result, Err(CacheError::NoStores)));

    let result = TieredCache::<u32>::builder(CacheConfig::default()).build();
    assert!(matches!(result, Err(CacheError::NoStores)));
}

#[tokio::test]
async fn test_new_with_memory_store() {
    let memory: Arc<dyn Store<String>> = Arc::new(MemoryStore::default());
    let cache = TieredCache::new(vec![memory], CacheConfig::default()).unwrap();

    assert_eq!(cache.stores().len(), 1);
    assert_eq!(cache.stores()[0].name(), "memory");

    cache.set("key", "value".to_owned(), None).await.unwrap();
    assert_eq!(cache.get("key").await.as_deref(), Some("value"));
}
