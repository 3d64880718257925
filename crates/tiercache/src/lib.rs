//! A multi-tier read-through / write-through cache.
//!
//! A [`TieredCache`] sits in front of an ordered list of independent [`Store`]s and presents
//! them as one logical cache. Reads go through the tiers in order, writes fan out to all of
//! them.
//!
//! The central primitive is [`TieredCache::wrap`], which turns an expensive computation into
//! a cached value:
//!
//! - Concurrent callers for the same key are coalesced, so the computation runs only once.
//! - A value found in a slower tier is backfilled into the faster tiers that missed it.
//! - A value that is close to expiring is served right away while a fresh one is computed
//!   in the background (stale-while-revalidate).
//!
//! ```ignore
//! let memory = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
//! let cache = TieredCache::builder(CacheConfig::default())
//!     .store(memory)
//!     .build()?;
//!
//! let user = cache
//!     .wrap("user:123", || async { load_user(123).await })
//!     .await?;
//! ```

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod cache;
mod coalesce;
pub mod config;
mod error;
mod events;
pub mod logging;
pub mod staleness;
mod store;
pub mod stores;
mod ttl;
mod utils;

pub use cache::{RefreshErrorHandler, TieredCache, TieredCacheBuilder, WrapOptions};
pub use coalesce::{CoalesceKey, Coalescer};
pub use config::CacheConfig;
pub use error::{AggregateStoreError, CacheError, ComputeError, StoreError, TierError};
pub use events::CacheEvent;
pub use staleness::Freshness;
pub use store::{RawEntry, Store};
pub use stores::{MemoryStore, MemoryStoreConfig};
pub use ttl::Ttl;
