use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::utils::futures::CallOnDrop;

pub use oneshot::Canceled;

type ComputationChannel<T> = Shared<oneshot::Receiver<T>>;
type ComputationMap<K, T> = Arc<Mutex<BTreeMap<K, ComputationChannel<T>>>>;

/// The key under which [`TieredCache`](crate::TieredCache) coalesces its computations.
///
/// Foreground lookups and background refreshes of the same cache key live in disjoint
/// namespaces, so a refresh never attaches to a lookup (or vice versa), while concurrent
/// refreshes of one key still share a single computation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoalesceKey {
    /// A foreground `wrap` call.
    Lookup(String),
    /// A background refresh of a stale value.
    Refresh(String),
}

impl fmt::Display for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup(key) => write!(f, "{key}"),
            Self::Refresh(key) => write!(f, "refresh:{key}"),
        }
    }
}

/// Deduplicates concurrent computations that share a key.
///
/// The first caller for a key spawns the computation on the current tokio runtime, every
/// caller that arrives before it settles attaches to the very same result. Once the
/// computation settles, it is evicted *before* its result is published, so the next caller
/// starts a fresh computation.
///
/// Computations are detached from their callers: dropping the returned future does not
/// cancel the computation.
pub struct Coalescer<K, T> {
    /// The currently running computations.
    current_computations: ComputationMap<K, T>,
}

impl<K, T> Clone for Coalescer<K, T> {
    fn clone(&self) -> Self {
        Self {
            current_computations: Arc::clone(&self.current_computations),
        }
    }
}

impl<K, T> Default for Coalescer<K, T> {
    fn default() -> Self {
        Self {
            current_computations: Default::default(),
        }
    }
}

impl<K, T> fmt::Debug for Coalescer<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .current_computations
            .try_lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("Coalescer")
            .field("running computations", &running)
            .finish()
    }
}

impl<K, T> Coalescer<K, T>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new coalescer without any running computations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of computations that are currently running.
    pub fn running(&self) -> usize {
        self.current_computations.lock().len()
    }

    /// Runs the computation created by `make_computation`, unless one is already running for
    /// `key`, in which case its result is shared.
    ///
    /// `make_computation` is invoked while holding the internal lock. It should only create the
    /// future, and must not call back into this coalescer.
    ///
    /// The returned future resolves to [`Canceled`] if the computation panicked, or the runtime
    /// shut down before it completed.
    pub fn coalesce<F, Fut>(
        &self,
        key: K,
        make_computation: F,
    ) -> BoxFuture<'static, Result<T, Canceled>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (channel, task) = {
            let mut current_computations = self.current_computations.lock();
            if let Some(channel) = current_computations.get(&key) {
                metric!(counter("caches.coalesced.hit") += 1);
                return channel.clone().boxed();
            }

            metric!(counter("caches.coalesced.miss") += 1);
            let (channel, task) = self.create_channel(key.clone(), make_computation(), None);
            let evicted = current_computations.insert(key, channel.clone());
            debug_assert!(evicted.is_none());
            (channel, task)
        };

        // The lock must be released here, a task that fails to spawn evicts its own entry.
        tokio::spawn(task);
        channel.boxed()
    }

    /// Like [`coalesce`](Self::coalesce), but a *new* computation needs to acquire one of the
    /// shared `permits` first.
    ///
    /// We count down towards zero, and if we reach or surpass it, no computation is started
    /// and `None` is returned. Attaching to an already running computation is always possible.
    /// The permit is given back once the computation settles.
    pub fn coalesce_limited<F, Fut>(
        &self,
        key: K,
        permits: &Arc<AtomicIsize>,
        make_computation: F,
    ) -> Option<BoxFuture<'static, Result<T, Canceled>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (channel, task) = {
            let mut current_computations = self.current_computations.lock();
            if let Some(channel) = current_computations.get(&key) {
                metric!(counter("caches.coalesced.hit") += 1);
                return Some(channel.clone().boxed());
            }

            // Short-circuiting here means we don't create a channel at all, and don't
            // put it into `current_computations`.
            if permits.fetch_sub(1, Ordering::Relaxed) <= 0 {
                permits.fetch_add(1, Ordering::Relaxed);
                metric!(counter("caches.refresh.limit_hit") += 1);
                return None;
            }

            metric!(counter("caches.coalesced.miss") += 1);
            let (channel, task) =
                self.create_channel(key.clone(), make_computation(), Some(Arc::clone(permits)));
            let evicted = current_computations.insert(key, channel.clone());
            debug_assert!(evicted.is_none());
            (channel, task)
        };

        tokio::spawn(task);
        Some(channel.boxed())
    }

    /// Creates a shareable channel for the result of `computation`, along with the task that
    /// runs it and needs to be spawned.
    ///
    /// Dropping the task, whether it ran or not, evicts `key` and gives back the permit.
    fn create_channel<Fut>(
        &self,
        key: K,
        computation: Fut,
        permits: Option<Arc<AtomicIsize>>,
    ) -> (ComputationChannel<T>, BoxFuture<'static, ()>)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = CallOnDrop::new(move || {
            if let Some(permits) = permits {
                permits.fetch_add(1, Ordering::Relaxed);
            }
            current_computations.lock().remove(&key);
        });

        let task = async move {
            let result = computation.await;
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        (receiver.shared(), task.boxed())
    }
}
