use std::sync::{Arc, Mutex};
use std::time::Duration;

use tiercache::{CacheConfig, TieredCache, WrapOptions};
use tiercache_test::{Computations, FaultyStore, cache_with, settle, setup};

fn swr_options() -> WrapOptions<&'static str> {
    WrapOptions::default()
        .ttl(Duration::from_millis(2000))
        .refresh_threshold(Duration::from_millis(1000))
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate() {
    setup();

    let store = FaultyStore::<&str>::new("memory");
    let cache = cache_with(CacheConfig::default(), &[store.clone()]);
    let calls = Computations::new();

    let value = cache
        .wrap_with("key", swr_options(), calls.returning("A"))
        .await
        .unwrap();
    assert_eq!(value, "A");

    // still fresh, nothing is recomputed
    tokio::time::advance(Duration::from_millis(500)).await;
    let value = cache
        .wrap_with("key", swr_options(), calls.returning("X"))
        .await
        .unwrap();
    assert_eq!(value, "A");
    settle().await;
    assert_eq!(calls.count(), 1);

    // stale, the old value is served and refreshed in the background
    tokio::time::advance(Duration::from_millis(501)).await;
    let value = cache
        .wrap_with("key", swr_options(), calls.returning("B"))
        .await
        .unwrap();
    assert_eq!(value, "A");

    settle().await;
    assert_eq!(calls.count(), 2);
    assert_eq!(cache.get("key").await, Some("B"));

    let value = cache
        .wrap_with("key", swr_options(), calls.returning("C"))
        .await
        .unwrap();
    assert_eq!(value, "B");
    settle().await;
    assert_eq!(calls.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_does_not_block_caller() {
    setup();

    let store = FaultyStore::<&str>::new("memory");
    let cache = cache_with(CacheConfig::default(), &[store.clone()]);
    let calls = Computations::new();

    cache
        .wrap_with("key", swr_options(), calls.returning("A"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;

    let value = cache
        .wrap_with(
            "key",
            swr_options(),
            calls.delayed(Duration::from_secs(10), "B"),
        )
        .await
        .unwrap();
    assert_eq!(value, "A");
    assert_eq!(store.peek("key").await.unwrap().value, "A");

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(cache.get("key").await, Some("B"));
}

#[tokio::test(start_paused = true)]
async fn test_default_refresh_threshold() {
    setup();

    let config = CacheConfig {
        ttl: Some(Duration::from_millis(2000)),
        refresh_threshold: Some(Duration::from_millis(1000)),
        ..Default::default()
    };
    let store = FaultyStore::<&str>::new("memory");
    let cache = cache_with(config, &[store.clone()]);
    let calls = Computations::new();

    cache.wrap("key", calls.returning("A")).await.unwrap();
    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(cache.wrap("key", calls.returning("B")).await.unwrap(), "A");

    settle().await;
    assert_eq!(cache.get("key").await, Some("B"));

    // a zero threshold on the call disables refreshing
    tokio::time::advance(Duration::from_millis(1500)).await;
    let options = WrapOptions::default().refresh_threshold(Duration::ZERO);
    let value = cache
        .wrap_with("key", options, calls.returning("C"))
        .await
        .unwrap();
    assert_eq!(value, "B");
    settle().await;
    assert_eq!(calls.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_are_coalesced() {
    setup();

    let store = FaultyStore::<&str>::new("memory");
    let cache = cache_with(CacheConfig::default(), &[store.clone()]);
    let calls = Computations::new();

    cache
        .wrap_with("key", swr_options(), calls.returning("A"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;

    for _ in 0..5 {
        let compute = calls.delayed(Duration::from_millis(100), "B");
        let value = cache
            .wrap_with("key", swr_options(), compute)
            .await
            .unwrap();
        assert_eq!(value, "A");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(calls.count(), 2);
    assert_eq!(cache.get("key").await, Some("B"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_stale_value() {
    setup();

    let failures = Arc::new(Mutex::new(Vec::new()));
    let store = FaultyStore::<&str>::new("memory");
    let cache = TieredCache::builder(CacheConfig::default())
        .store(store.clone())
        .on_background_refresh_error({
            let failures = Arc::clone(&failures);
            move |key, err| {
                failures
                    .lock()
                    .unwrap()
                    .push((key.to_owned(), err.to_string()));
            }
        })
        .build()
        .unwrap();
    let calls = Computations::new();

    cache
        .wrap_with("key", swr_options(), calls.returning("A"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1001)).await;

    let value = cache
        .wrap_with("key", swr_options(), calls.failing("upstream down"))
        .await
        .unwrap();
    assert_eq!(value, "A");
    settle().await;

    assert_eq!(
        *failures.lock().unwrap(),
        [(
            "key".to_owned(),
            "computation failed: upstream down".to_owned()
        )]
    );
    assert_eq!(cache.get("key").await, Some("A"));

    // the stale value lives until its original expiration
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_eq!(cache.get("key").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_write() {
    setup();

    let failures = Arc::new(Mutex::new(Vec::new()));
    let store = FaultyStore::<&str>::new("memory");
    let cache = TieredCache::builder(CacheConfig::default())
        .store(store.clone())
        .on_background_refresh_error({
            let failures = Arc::clone(&failures);
            move |key, _err| failures.lock().unwrap().push(key.to_owned())
        })
        .build()
        .unwrap();
    let calls = Computations::new();

    cache
        .wrap_with("key", swr_options(), calls.returning("A"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1001)).await;

    store.fail_writes(true);
    let value = cache
        .wrap_with("key", swr_options(), calls.returning("B"))
        .await
        .unwrap();
    assert_eq!(value, "A");
    settle().await;

    assert_eq!(*failures.lock().unwrap(), ["key"]);
    assert_eq!(store.peek("key").await.unwrap().value, "A");
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_limit() {
    setup();

    let config = CacheConfig {
        max_background_refreshes: Some(1),
        ..Default::default()
    };
    let store = FaultyStore::<&str>::new("memory");
    let cache = cache_with(config, &[store.clone()]);
    let calls = Computations::new();

    for key in ["a", "b"] {
        cache
            .wrap_with(key, swr_options(), calls.returning("A"))
            .await
            .unwrap();
    }
    tokio::time::advance(Duration::from_millis(1500)).await;

    let compute = calls.delayed(Duration::from_millis(100), "B");
    let value = cache.wrap_with("a", swr_options(), compute).await.unwrap();
    assert_eq!(value, "A");
    // all permits are taken, "b" is served stale without a refresh
    let value = cache
        .wrap_with("b", swr_options(), calls.returning("B"))
        .await
        .unwrap();
    assert_eq!(value, "A");

    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(calls.count(), 3);
    assert_eq!(cache.get("a").await, Some("B"));
    assert_eq!(cache.get("b").await, Some("A"));

    // the permit was given back
    let value = cache
        .wrap_with("b", swr_options(), calls.returning("B"))
        .await
        .unwrap();
    assert_eq!(value, "A");
    settle().await;
    assert_eq!(calls.count(), 4);
    assert_eq!(cache.get("b").await, Some("B"));
}
