use std::time::Duration;

use tiercache::{CacheConfig, Store, WrapOptions};
use tiercache_test::{Computations, FaultyStore, cache_with, settle, setup};

#[tokio::test(start_paused = true)]
async fn test_backfill_faster_tiers() {
    setup();

    let local = FaultyStore::<u32>::new("local");
    let shared = FaultyStore::<u32>::new("shared");
    let remote = FaultyStore::<u32>::new("remote");
    let cache = cache_with(
        CacheConfig::default(),
        &[local.clone(), shared.clone(), remote.clone()],
    );
    let calls = Computations::new();

    remote.set("key", 7, None).await.unwrap();

    let options = WrapOptions::default().ttl(Duration::from_secs(30));
    let value = cache
        .wrap_with("key", options, calls.returning(0))
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(calls.count(), 0);

    for store in [&local, &shared] {
        let entry = store.peek("key").await.unwrap();
        assert_eq!(entry.value, 7);
        assert_eq!(entry.remaining_ttl(), Some(Duration::from_secs(30)));
    }
    // the tier that had the value is left alone
    assert_eq!(remote.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_from_middle_tier() {
    setup();

    let local = FaultyStore::<u32>::new("local");
    let shared = FaultyStore::<u32>::new("shared");
    let remote = FaultyStore::<u32>::new("remote");
    let cache = cache_with(
        CacheConfig::default(),
        &[local.clone(), shared.clone(), remote.clone()],
    );
    let calls = Computations::new();

    shared.set("key", 7, None).await.unwrap();

    assert_eq!(cache.wrap("key", calls.returning(0)).await.unwrap(), 7);
    assert_eq!(local.peek("key").await.unwrap().value, 7);
    assert_eq!(remote.reads(), 0);
    assert_eq!(remote.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_fast_tier() {
    setup();

    let fast = FaultyStore::<u32>::broken("fast");
    let slow = FaultyStore::<u32>::new("slow");
    let cache = cache_with(CacheConfig::default(), &[fast.clone(), slow.clone()]);
    let calls = Computations::new();

    // a miss computes and writes to every tier that works
    assert_eq!(cache.wrap("computed", calls.returning(1)).await.unwrap(), 1);
    assert_eq!(slow.peek("computed").await.unwrap().value, 1);
    assert_eq!(fast.writes(), 1);

    // a hit in the slow tier is backfilled into the fast one, which fails
    slow.set("found", 2, None).await.unwrap();
    assert_eq!(cache.wrap("found", calls.returning(0)).await.unwrap(), 2);
    assert_eq!(fast.writes(), 2);
    assert_eq!(calls.count(), 1);

    assert_eq!(cache.get("found").await, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_writes_serving_tier_only() {
    setup();

    let config = CacheConfig {
        ttl: Some(Duration::from_secs(2)),
        refresh_threshold: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let local = FaultyStore::<u32>::new("local");
    let remote = FaultyStore::<u32>::new("remote");
    let cache = cache_with(config, &[local.clone(), remote.clone()]);
    let calls = Computations::new();

    // about to expire in the remote tier
    remote
        .set("key", 1, Some(Duration::from_millis(500)))
        .await
        .unwrap();

    assert_eq!(cache.wrap("key", calls.returning(2)).await.unwrap(), 1);
    settle().await;
    assert_eq!(calls.count(), 1);

    // the backfilled value stays in the local tier, only the remote one is refreshed
    assert_eq!(local.peek("key").await.unwrap().value, 1);
    let refreshed = remote.peek("key").await.unwrap();
    assert_eq!(refreshed.value, 2);
    assert_eq!(refreshed.remaining_ttl(), Some(Duration::from_millis(1999)));
}
