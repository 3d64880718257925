use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicIsize;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::coalesce::{CoalesceKey, Coalescer};
use crate::config::CacheConfig;
use crate::error::{AggregateStoreError, CacheError, ComputeError, StoreError, TierError};
use crate::events::CacheEvent;
use crate::staleness::{self, Freshness};
use crate::store::Store;
use crate::ttl::{Ttl, effective_ttl};

/// Callback invoked with the key and the error when a background refresh fails.
pub type RefreshErrorHandler = Arc<dyn Fn(&str, &CacheError) + Send + Sync>;

/// Per-call options of [`TieredCache::wrap_with`].
pub struct WrapOptions<V> {
    /// The TTL of written values, overriding [`CacheConfig::ttl`].
    pub ttl: Option<Ttl<V>>,
    /// The refresh threshold, overriding [`CacheConfig::refresh_threshold`].
    pub refresh_threshold: Option<Duration>,
}

impl<V> WrapOptions<V> {
    /// Sets the TTL of written values.
    pub fn ttl(mut self, ttl: impl Into<Ttl<V>>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    /// Sets the refresh threshold.
    pub fn refresh_threshold(mut self, refresh_threshold: Duration) -> Self {
        self.refresh_threshold = Some(refresh_threshold);
        self
    }
}

impl<V> Default for WrapOptions<V> {
    fn default() -> Self {
        Self {
            ttl: None,
            refresh_threshold: None,
        }
    }
}

impl<V> Clone for WrapOptions<V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl.clone(),
            refresh_threshold: self.refresh_threshold,
        }
    }
}

impl<V> fmt::Debug for WrapOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapOptions")
            .field("ttl", &self.ttl)
            .field("refresh_threshold", &self.refresh_threshold)
            .finish()
    }
}

/// A value found in one of the tiers.
struct Hit<V> {
    /// The index of the tier that had the value.
    tier: usize,
    value: V,
    /// The time the value has left to live in that tier.
    remaining_ttl: Option<Duration>,
}

struct CacheInner<V> {
    stores: Vec<Arc<dyn Store<V>>>,
    config: CacheConfig,
    on_background_refresh_error: Option<RefreshErrorHandler>,

    /// Deduplicates concurrent lookups and refreshes.
    computations: Coalescer<CoalesceKey, Result<V, CacheError>>,

    /// Remaining number of background refreshes that may be started, if limited.
    refresh_permits: Option<Arc<AtomicIsize>>,

    events: broadcast::Sender<CacheEvent<V>>,
}

/// A cache that presents an ordered list of [`Store`]s as a single logical cache.
///
/// The first store is the fastest tier: it is read first, and its remaining TTL decides
/// when values are refreshed in the background. Writes always go to all tiers.
///
/// This is a cheap handle, clones share the same stores and running computations.
pub struct TieredCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field("stores", &self.inner.stores)
            .field("config", &self.inner.config)
            .field("computations", &self.inner.computations)
            .finish()
    }
}

/// Builds a [`TieredCache`].
pub struct TieredCacheBuilder<V> {
    config: CacheConfig,
    stores: Vec<Arc<dyn Store<V>>>,
    on_background_refresh_error: Option<RefreshErrorHandler>,
}

impl<V> TieredCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Appends a store as the next (slower) tier.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: Store<V> + 'static,
    {
        self.stores.push(store);
        self
    }

    /// Sets the callback that is invoked when a background refresh fails.
    pub fn on_background_refresh_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &CacheError) + Send + Sync + 'static,
    {
        self.on_background_refresh_error = Some(Arc::new(f));
        self
    }

    /// Creates the cache.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NoStores`] if no store was added.
    pub fn build(self) -> Result<TieredCache<V>, CacheError> {
        if self.stores.is_empty() {
            return Err(CacheError::NoStores);
        }

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let refresh_permits = self
            .config
            .max_background_refreshes
            .map(|max| Arc::new(AtomicIsize::new(max.try_into().unwrap_or(isize::MAX))));

        Ok(TieredCache {
            inner: Arc::new(CacheInner {
                stores: self.stores,
                config: self.config,
                on_background_refresh_error: self.on_background_refresh_error,
                computations: Coalescer::new(),
                refresh_permits,
                events,
            }),
        })
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Starts building a cache with the given configuration.
    pub fn builder(config: CacheConfig) -> TieredCacheBuilder<V> {
        TieredCacheBuilder {
            config,
            stores: Vec::new(),
            on_background_refresh_error: None,
        }
    }

    /// Creates a cache from an ordered list of stores.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NoStores`] if `stores` is empty.
    pub fn new(stores: Vec<Arc<dyn Store<V>>>, config: CacheConfig) -> Result<Self, CacheError> {
        TieredCacheBuilder {
            config,
            stores,
            on_background_refresh_error: None,
        }
        .build()
    }

    /// The stores of this cache, in tier order.
    pub fn stores(&self) -> &[Arc<dyn Store<V>>] {
        &self.inner.stores
    }

    /// The configuration of this cache.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Subscribes to [`CacheEvent`]s.
    ///
    /// Dropping the receiver unsubscribes again.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent<V>> {
        self.inner.events.subscribe()
    }

    /// Returns the value stored at `key` in the first tier that has one.
    ///
    /// Tiers that fail to read are skipped, so this never fails.
    pub async fn get(&self, key: &str) -> Option<V> {
        metric!(counter("caches.access") += 1, "op" => "get");

        for (tier, store) in self.inner.stores.iter().enumerate() {
            match store.get(key).await {
                Ok(Some(value)) => {
                    metric!(counter("caches.tier.hit") += 1, "tier" => &tier.to_string());
                    return Some(value);
                }
                Ok(None) => {
                    tracing::trace!(key, tier, store = store.name(), "Cache miss");
                }
                Err(err) => {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        key,
                        tier,
                        store = store.name(),
                        "Failed to read from store",
                    );
                }
            }
        }

        metric!(counter("caches.miss") += 1);
        None
    }

    /// Writes `value` to all tiers.
    ///
    /// Uses [`CacheConfig::ttl`] if no `ttl` is given.
    ///
    /// # Errors
    ///
    /// Fails if any of the tiers failed. The other tiers keep the new value.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<V, CacheError> {
        let ttl = ttl.or(self.inner.config.ttl);
        let result = self.inner.write_all(key, &value, ttl).await;

        self.inner.emit(|| CacheEvent::Set {
            key: key.to_owned(),
            value: value.clone(),
            error: result.clone().err(),
        });

        result.map(|()| value)
    }

    /// Deletes `key` from all tiers.
    ///
    /// # Errors
    ///
    /// Fails if any of the tiers failed. The key stays deleted in the other tiers.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let results = join_all(self.inner.stores.iter().map(|store| store.delete(key))).await;
        let result = self.inner.collect_errors(results);

        self.inner.emit(|| CacheEvent::Delete {
            key: key.to_owned(),
            error: result.clone().err(),
        });

        result.map(|()| true)
    }

    /// Removes all entries from all tiers.
    ///
    /// # Errors
    ///
    /// Fails if any of the tiers failed. The other tiers stay cleared.
    pub async fn clear(&self) -> Result<bool, CacheError> {
        let results = join_all(self.inner.stores.iter().map(|store| store.clear())).await;
        let result = self.inner.collect_errors(results);

        self.inner.emit(|| CacheEvent::Clear {
            error: result.clone().err(),
        });

        result.map(|()| true)
    }

    /// Returns the cached value for `key`, or computes and caches it.
    ///
    /// This is [`wrap_with`](Self::wrap_with) using the cache defaults for TTL and refresh
    /// threshold.
    pub async fn wrap<F, Fut, E>(&self, key: &str, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.wrap_with(key, WrapOptions::default(), compute).await
    }

    /// Returns the cached value for `key`, or computes and caches it.
    ///
    /// Concurrent calls for the same key are coalesced, and only the first one runs. It
    /// goes through the following steps:
    ///
    /// 1. The tiers are read in order, until one has a value.
    /// 2. If none has, `compute` runs and its result is written to all tiers.
    /// 3. Otherwise, the value is backfilled into the faster tiers that missed it.
    /// 4. If the value has less than the refresh threshold left to live, `compute` runs in a
    ///    background task, and its result is written into the tier the value came from.
    ///
    /// The value is returned right away in the last two cases, and never waits for the
    /// background refresh.
    ///
    /// # Errors
    ///
    /// Fails only if no tier had a value and `compute` failed. Failing to write a computed
    /// value, or to backfill a found value, is logged but does not fail the call.
    pub async fn wrap_with<F, Fut, E>(
        &self,
        key: &str,
        options: WrapOptions<V>,
        compute: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        metric!(counter("caches.access") += 1, "op" => "wrap");

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_owned();
        let computation = self
            .inner
            .computations
            .coalesce(CoalesceKey::Lookup(key.to_owned()), move || {
                inner.lookup_or_compute(owned_key, options, compute)
            });

        computation
            .await
            .unwrap_or_else(|_canceled| Err(CacheError::Canceled))
    }
}

impl<V> CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Publishes an event, if anyone is listening.
    fn emit(&self, event: impl FnOnce() -> CacheEvent<V>) {
        if self.events.receiver_count() > 0 {
            // a send can only fail if all receivers were dropped in the meantime
            self.events.send(event()).ok();
        }
    }

    /// Turns the per-tier results of a fan-out into an aggregate result.
    fn collect_errors(&self, results: Vec<Result<(), StoreError>>) -> Result<(), CacheError> {
        let errors: Vec<_> = self
            .stores
            .iter()
            .zip(results)
            .enumerate()
            .filter_map(|(tier, (store, result))| {
                let error = result.err()?;
                Some(TierError {
                    tier,
                    store: store.name().to_owned(),
                    error,
                })
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateStoreError { errors }.into())
        }
    }

    /// Writes `value` to all tiers concurrently and waits for all of them.
    async fn write_all(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let writes = self
            .stores
            .iter()
            .map(|store| store.set(key, value.clone(), ttl));
        let results = join_all(writes).await;
        self.collect_errors(results)
    }

    /// Reads the tiers in order and returns the first value found.
    async fn lookup(&self, key: &str) -> Option<Hit<V>> {
        for (tier, store) in self.stores.iter().enumerate() {
            match store.get_raw(key).await {
                Ok(Some(entry)) => {
                    metric!(counter("caches.tier.hit") += 1, "tier" => &tier.to_string());
                    let remaining_ttl = entry.remaining_ttl();
                    return Some(Hit {
                        tier,
                        value: entry.value,
                        remaining_ttl,
                    });
                }
                Ok(None) => {
                    tracing::trace!(key, tier, store = store.name(), "Cache miss");
                }
                Err(err) => {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        key,
                        tier,
                        store = store.name(),
                        "Failed to read from store",
                    );
                }
            }
        }

        None
    }

    /// Writes a value found in `tier` into all the faster tiers.
    ///
    /// This is best-effort, failures are only logged.
    async fn backfill(&self, key: &str, value: &V, tier: usize, ttl: Option<Duration>) {
        let faster_tiers = &self.stores[..tier];
        let results = join_all(
            faster_tiers
                .iter()
                .map(|store| store.set(key, value.clone(), ttl)),
        )
        .await;

        for (tier, (store, result)) in faster_tiers.iter().zip(results).enumerate() {
            if let Err(err) = result {
                metric!(counter("caches.backfill.error") += 1, "tier" => &tier.to_string());
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key,
                    tier,
                    store = store.name(),
                    "Failed to backfill store",
                );
            }
        }
    }

    /// The body of a `wrap` call, running inside the coalesced computation.
    async fn lookup_or_compute<F, Fut, E>(
        self: Arc<Self>,
        key: String,
        options: WrapOptions<V>,
        compute: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let Some(hit) = self.lookup(&key).await else {
            metric!(counter("caches.miss") += 1);
            metric!(counter("caches.computation") += 1);

            let value = compute().await.map_err(ComputeError::new)?;
            let ttl = effective_ttl(options.ttl.as_ref(), &value, self.config.ttl);

            let result = self.write_all(&key, &value, ttl).await;
            if let Err(err) = &result {
                tracing::warn!(
                    error = err as &dyn std::error::Error,
                    key = %key,
                    "Failed to store computed value",
                );
            }
            self.emit(|| CacheEvent::Set {
                key: key.clone(),
                value: value.clone(),
                error: result.err(),
            });

            return Ok(value);
        };

        let Hit {
            tier,
            value,
            remaining_ttl,
        } = hit;
        let ttl = effective_ttl(options.ttl.as_ref(), &value, self.config.ttl);

        if tier > 0 {
            self.backfill(&key, &value, tier, ttl).await;
        }

        let refresh_threshold = options.refresh_threshold.or(self.config.refresh_threshold);
        if staleness::decide(remaining_ttl, refresh_threshold) == Freshness::Refresh {
            self.spawn_refresh(key, tier, value.clone(), options.ttl, compute);
        }

        Ok(value)
    }

    /// Recomputes a stale value in a deduplicated background task, which we will not await.
    fn spawn_refresh<F, Fut, E>(
        self: &Arc<Self>,
        key: String,
        tier: usize,
        stale: V,
        ttl: Option<Ttl<V>>,
        compute: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        tracing::trace!(key = %key, tier, "Spawning deduplicated refresh");

        let this = Arc::clone(self);
        let refresh_key = CoalesceKey::Refresh(key.clone());
        let make_refresh = move || this.refresh(key, tier, stale, ttl, compute);

        let _not_awaiting_future = match &self.refresh_permits {
            Some(permits) => self
                .computations
                .coalesce_limited(refresh_key, permits, make_refresh),
            None => Some(self.computations.coalesce(refresh_key, make_refresh)),
        };
    }

    /// Computes a new value and writes it into `tier`, replacing `stale`.
    ///
    /// Failures are reported to the refresh error handler and as [`CacheEvent::Refresh`] with
    /// the `stale` value, which stays cached.
    async fn refresh<F, Fut, E>(
        self: Arc<Self>,
        key: String,
        tier: usize,
        stale: V,
        ttl: Option<Ttl<V>>,
        compute: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        metric!(counter("caches.computation") += 1, "is_refresh" => "true");

        let value = match compute().await {
            Ok(value) => value,
            Err(err) => {
                let err = CacheError::from(ComputeError::new(err));
                self.refresh_failed(&key, stale, &err);
                return Err(err);
            }
        };

        let ttl = effective_ttl(ttl.as_ref(), &value, self.config.ttl);
        let store = &self.stores[tier];
        if let Err(error) = store.set(&key, value.clone(), ttl).await {
            let err = CacheError::from(AggregateStoreError {
                errors: vec![TierError {
                    tier,
                    store: store.name().to_owned(),
                    error,
                }],
            });
            self.refresh_failed(&key, stale, &err);
            return Err(err);
        }

        metric!(counter("caches.refresh") += 1, "status" => "ok");
        self.emit(|| CacheEvent::Refresh {
            key,
            value: value.clone(),
            error: None,
        });

        Ok(value)
    }

    fn refresh_failed(&self, key: &str, stale: V, err: &CacheError) {
        metric!(counter("caches.refresh") += 1, "status" => "error");
        tracing::error!(
            error = err as &dyn std::error::Error,
            key,
            "Background refresh failed",
        );

        if let Some(handler) = &self.on_background_refresh_error {
            handler(key, err);
        }
        self.emit(|| CacheEvent::Refresh {
            key: key.to_owned(),
            value: stale,
            error: Some(err.clone()),
        });
    }
}
