use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The time-to-live of a value written by [`TieredCache::wrap`](crate::TieredCache::wrap).
///
/// The TTL is either fixed, or derived from the value that is about to be written, for example
/// to cache negative results for a shorter time.
pub enum Ttl<V> {
    /// The same TTL for every value.
    Fixed(Duration),
    /// A TTL computed from the value that is written.
    Derived(Arc<dyn Fn(&V) -> Duration + Send + Sync>),
}

impl<V> Ttl<V> {
    /// Creates a TTL derived from the written value.
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&V) -> Duration + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }

    /// Returns the TTL for `value`.
    pub fn resolve(&self, value: &V) -> Duration {
        match self {
            Self::Fixed(ttl) => *ttl,
            Self::Derived(f) => f(value),
        }
    }
}

/// Resolves the effective TTL of `value`, falling back to the cache default.
pub(crate) fn effective_ttl<V>(
    ttl: Option<&Ttl<V>>,
    value: &V,
    default: Option<Duration>,
) -> Option<Duration> {
    ttl.map(|ttl| ttl.resolve(value)).or(default)
}

impl<V> Clone for Ttl<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(ttl) => Self::Fixed(*ttl),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
        }
    }
}

impl<V> fmt::Debug for Ttl<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(ttl) => f.debug_tuple("Fixed").field(ttl).finish(),
            Self::Derived(_) => f.debug_tuple("Derived").finish_non_exhaustive(),
        }
    }
}

impl<V> From<Duration> for Ttl<V> {
    fn from(ttl: Duration) -> Self {
        Self::Fixed(ttl)
    }
}
