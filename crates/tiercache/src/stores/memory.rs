use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::{self, RawEntry, Store};

/// Configuration of a [`MemoryStore`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// The maximum number of entries kept in memory.
    ///
    /// Once the capacity is reached, the least useful entries are evicted.
    pub max_capacity: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
        }
    }
}

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct MemoryItem<V> {
    /// When this item expires, `None` if it never does.
    deadline: Option<Instant>,
    /// The actual data.
    value: V,
}

impl<V> MemoryItem<V> {
    fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| deadline <= Instant::now())
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`MemoryItem`] deadline as the explicit
/// expiration time.
struct ItemExpiration;

impl ItemExpiration {
    /// Returns the time left until `deadline`, saturating at zero for deadlines in the past.
    fn time_left<V>(item: &MemoryItem<V>) -> Option<Duration> {
        item.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl<V> moka::Expiry<String, MemoryItem<V>> for ItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryItem<V>,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        Self::time_left(value)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryItem<V>,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Self::time_left(value)
    }
}

type InMemoryCache<V> = moka::future::Cache<String, MemoryItem<V>>;

/// An in-process [`Store`] backed by a bounded [`moka`] cache.
///
/// Each entry carries its own deadline. Entries are evicted by moka once they expire, and
/// expired entries that were not evicted yet are never returned.
pub struct MemoryStore<V> {
    cache: InMemoryCache<V>,
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new, empty memory store.
    pub fn new(config: MemoryStoreConfig) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(config.max_capacity)
            .name("memory")
            .expire_after(ItemExpiration)
            .build();

        Self { cache }
    }

    /// The approximate number of entries in this store.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl<V> Default for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl<V> fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self.get_raw(key).await?.map(|entry| entry.value))
    }

    async fn get_raw(&self, key: &str) -> Result<Option<RawEntry<V>>, StoreError> {
        let Some(item) = self.cache.get(key).await else {
            return Ok(None);
        };
        if item.is_expired() {
            return Ok(None);
        }

        Ok(Some(RawEntry {
            value: item.value,
            expires_at: item.deadline,
        }))
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), StoreError> {
        let item = MemoryItem {
            deadline: store::deadline(ttl),
            value,
        };
        self.cache.insert(key.to_owned(), item).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.cache.invalidate_all();
        Ok(())
    }
}
