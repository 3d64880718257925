use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;

/// A value read from a [`Store`] together with its expiration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry<V> {
    /// The stored value.
    pub value: V,
    /// When the entry expires, or `None` if the store does not track an expiry for it.
    pub expires_at: Option<Instant>,
}

impl<V> RawEntry<V> {
    /// Creates an entry that expires `ttl` from now.
    ///
    /// The entry never expires when `ttl` is `None`, or too large to be represented.
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: deadline(ttl),
        }
    }

    /// Returns the time left until this entry expires.
    ///
    /// This saturates at zero for entries whose expiration time is in the past, and is `None`
    /// if no expiration time is known.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Returns the instant `ttl` from now, or `None` if there is no `ttl` or the instant overflows.
pub(crate) fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| Instant::now().checked_add(ttl))
}

/// A single tier of a [`TieredCache`](crate::TieredCache).
///
/// A store is an independent key-value store with per-entry TTL support, for example an
/// in-process memory cache or a networked cache. Every operation can fail independently,
/// and the store is responsible for expiring entries on its own.
#[async_trait]
pub trait Store<V>: fmt::Debug + Send + Sync {
    /// A name for logs and metrics, such as `"memory"` or `"redis"`.
    fn name(&self) -> &str;

    /// Returns the value stored at `key`, or `None` for cache misses.
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError>;

    /// Returns the value stored at `key` along with its expiration time.
    async fn get_raw(&self, key: &str) -> Result<Option<RawEntry<V>>, StoreError>;

    /// Stores `value` at `key`, expiring after `ttl` if one is given.
    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Removes `key` from the store.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Removes all entries from the store.
    async fn clear(&self) -> Result<(), StoreError>;
}
