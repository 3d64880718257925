//! [`Store`](crate::Store) implementations shipped with the cache.

mod memory;

pub use memory::{MemoryStore, MemoryStoreConfig};
