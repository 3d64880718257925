use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when a single [`Store`](crate::Store) operation fails.
///
/// Read errors are never surfaced to callers of the cache, the tier is simply skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached, for example due to connection loss.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store did not respond in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The stored data could not be (de)serialized.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The store refused to take more data.
    #[error("capacity exceeded")]
    CapacityExceeded,
    /// Any other store specific problem.
    #[error("{0}")]
    Other(String),
}

/// The failure of one tier during a fan-out write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierError {
    /// The index of the tier in the store list.
    pub tier: usize,
    /// The [`Store::name`](crate::Store::name) of the tier.
    pub store: String,
    /// The error the tier failed with.
    pub error: StoreError,
}

impl fmt::Display for TierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {} ({}): {}", self.tier, self.store, self.error)
    }
}

/// One or more tiers failed during `set`, `delete` or `clear`.
///
/// The tiers that succeeded stay mutated, nothing is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStoreError {
    /// The individual tier failures, in tier order.
    pub errors: Vec<TierError>,
}

impl fmt::Display for AggregateStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} store(s) failed", self.errors.len())?;
        for (i, error) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateStoreError {}

/// The error returned by a computation passed to [`TieredCache::wrap`](crate::TieredCache::wrap).
///
/// This is shared between all coalesced callers, which is why the underlying error lives
/// behind an [`Arc`]. Use [`ComputeError::downcast_ref`] to get at the original error.
#[derive(Debug, Clone)]
pub struct ComputeError(Arc<anyhow::Error>);

impl ComputeError {
    /// Wraps an arbitrary error.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Attempts to downcast to the original error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref()
    }

    /// Returns `true` if both errors originate from the very same computation failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for ComputeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// The central error type of [`TieredCache`](crate::TieredCache).
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cache was constructed without any store.
    #[error("at least one store is required")]
    NoStores,
    /// Writing to one or more tiers failed.
    #[error(transparent)]
    Store(#[from] AggregateStoreError),
    /// The computation failed and there was no cached value to fall back to.
    #[error("computation failed: {0}")]
    Compute(#[from] ComputeError),
    /// The task running the computation was dropped before it completed.
    ///
    /// This happens when the computation panics, or the runtime shuts down.
    #[error("computation channel dropped")]
    Canceled,
}

impl CacheError {
    /// Returns the [`ComputeError`] if this is a computation failure.
    pub fn as_compute(&self) -> Option<&ComputeError> {
        match self {
            Self::Compute(err) => Some(err),
            _ => None,
        }
    }
}
