//! Decides whether a cached value needs a background refresh.
//!
//! A hit is [`Freshness::Refresh`] when its remaining time-to-live dropped below the configured
//! refresh threshold. Such a value is still served right away, while a new value is computed in
//! the background (stale-while-revalidate).

use std::time::Duration;

/// The outcome of [`decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// The value can be served as-is.
    Fresh,
    /// The value can be served, but should be recomputed in the background.
    Refresh,
}

/// Decides whether a value with `remaining_ttl` left should be refreshed.
///
/// Values without a known expiration, and caches without a (non-zero) refresh threshold are
/// always [`Freshness::Fresh`].
pub fn decide(remaining_ttl: Option<Duration>, refresh_threshold: Option<Duration>) -> Freshness {
    match (remaining_ttl, refresh_threshold) {
        (Some(remaining), Some(threshold)) if !threshold.is_zero() && remaining < threshold => {
            Freshness::Refresh
        }
        _ => Freshness::Fresh,
    }
}
