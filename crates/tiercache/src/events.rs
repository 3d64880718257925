use crate::error::CacheError;

/// A notification about a mutation of the cache.
///
/// Events are delivered on a best-effort basis through
/// [`TieredCache::subscribe`](crate::TieredCache::subscribe). Slow subscribers may miss events,
/// and publishing an event never blocks or changes the outcome of the operation that caused it.
#[derive(Debug, Clone)]
pub enum CacheEvent<V> {
    /// A value was written to all tiers, or the attempt failed.
    Set {
        /// The key that was written.
        key: String,
        /// The value that was written.
        value: V,
        /// Set if at least one tier failed.
        error: Option<CacheError>,
    },
    /// A key was deleted from all tiers, or the attempt failed.
    Delete {
        /// The key that was deleted.
        key: String,
        /// Set if at least one tier failed.
        error: Option<CacheError>,
    },
    /// All tiers were cleared, or the attempt failed.
    Clear {
        /// Set if at least one tier failed.
        error: Option<CacheError>,
    },
    /// A stale value was recomputed in the background.
    Refresh {
        /// The refreshed key.
        key: String,
        /// The new value, or the stale value that stays cached if the refresh failed.
        value: V,
        /// Set if the computation or writing the new value failed.
        error: Option<CacheError>,
    },
}

impl<V> CacheEvent<V> {
    /// The key this event refers to, `None` for [`CacheEvent::Clear`].
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Set { key, .. } | Self::Delete { key, .. } | Self::Refresh { key, .. } => {
                Some(key)
            }
            Self::Clear { .. } => None,
        }
    }

    /// The error attached to this event, if the operation failed.
    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Set { error, .. }
            | Self::Delete { error, .. }
            | Self::Clear { error }
            | Self::Refresh { error, .. } => error.as_ref(),
        }
    }
}
