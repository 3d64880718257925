//! Helpers for testing the tiered cache.
//!
//! # Tracing
//!
//! Call [`setup`] at the beginning of every test to get trace logs of the cache, captured by
//! the test harness.
//!
//! # Stores
//!
//! [`FaultyStore`] is an in-memory store whose reads and writes can be switched to fail at
//! runtime, and which counts how often it was accessed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tracing_subscriber::filter::EnvFilter;

use tiercache::{CacheConfig, MemoryStore, RawEntry, Store, StoreError, TieredCache};

/// Setup the test environment.
///
/// Initializes logs: The logger only captures logs from the `tiercache` crate and test
/// output is captured by the test harness.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("tiercache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A boxed computation as accepted by [`TieredCache::wrap`].
pub type Compute<V> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<V>> + Send>;

/// Creates computations and counts how often any of them was invoked.
#[derive(Clone, Debug, Default)]
pub struct Computations {
    calls: Arc<AtomicUsize>,
}

impl Computations {
    /// Creates a new counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of computations that were invoked so far.
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A computation that immediately succeeds with `value`.
    pub fn returning<V: Send + 'static>(&self, value: V) -> Compute<V> {
        self.delayed(Duration::ZERO, value)
    }

    /// A computation that succeeds with `value` after `delay`.
    pub fn delayed<V: Send + 'static>(&self, delay: Duration, value: V) -> Compute<V> {
        let calls = Arc::clone(&self.calls);
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(value)
            }
            .boxed()
        })
    }

    /// A computation that fails with `message`.
    pub fn failing<V: Send + 'static>(&self, message: &'static str) -> Compute<V> {
        let calls = Arc::clone(&self.calls);
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(anyhow::anyhow!(message)) }.boxed()
        })
    }
}

/// An in-memory [`Store`] that can be told to fail.
pub struct FaultyStore<V> {
    name: &'static str,
    inner: MemoryStore<V>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<V> FaultyStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a working store.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: MemoryStore::default(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    /// Creates a store that fails all reads and writes.
    pub fn broken(name: &'static str) -> Arc<Self> {
        let store = Self::new(name);
        store.fail_reads(true);
        store.fail_writes(true);
        store
    }

    /// Makes `get`, `get_raw` fail or succeed.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes `set`, `delete` and `clear` fail or succeed.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The number of attempted reads.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The number of attempted writes, including deletes and clears.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Reads `key` directly, bypassing failures and counters.
    pub async fn peek(&self, key: &str) -> Option<RawEntry<V>> {
        self.inner.get_raw(key).await.ok().flatten()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is down", self.name)));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is down", self.name)));
        }
        Ok(())
    }
}

impl<V> fmt::Debug for FaultyStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyStore")
            .field("name", &self.name)
            .field("fail_reads", &self.fail_reads)
            .field("fail_writes", &self.fail_writes)
            .finish()
    }
}

#[async_trait]
impl<V> Store<V> for FaultyStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        self.check_read()?;
        self.inner.get(key).await
    }

    async fn get_raw(&self, key: &str) -> Result<Option<RawEntry<V>>, StoreError> {
        self.check_read()?;
        self.inner.get_raw(key).await
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.clear().await
    }
}

/// Creates a cache on top of the given stores, in tier order.
pub fn cache_with<V>(config: CacheConfig, stores: &[Arc<FaultyStore<V>>]) -> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    stores
        .iter()
        .fold(TieredCache::builder(config), |builder, store| {
            builder.store(Arc::clone(store))
        })
        .build()
        .unwrap()
}

/// Lets spawned background tasks run to completion.
///
/// Meant for tests with paused time, where this auto-advances the clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
