//! Cache module - TTL key-value store used for broker tokens and portfolio snapshots.

mod cache_traits;
mod ttl_cache;

pub use cache_traits::CacheStore;
pub use ttl_cache::TtlCache;

use crate::constants::PORTFOLIO_CACHE_PREFIX;

/// Cache key of the canonical (unfiltered) portfolio snapshot of a user.
pub fn portfolio_cache_key(user_id: &str) -> String {
    format!("{}:{}", PORTFOLIO_CACHE_PREFIX, user_id)
}
