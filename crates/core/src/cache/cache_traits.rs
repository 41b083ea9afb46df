use std::time::Duration;

use crate::errors::Result;

/// Key-value store with a per-key time to live.
///
/// Implementations must allow concurrent access from many tasks; writes to one
/// key must not block readers or writers of other keys.
pub trait CacheStore<V>: Send + Sync {
    /// Returns the value if present and not expired.
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()>;

    fn delete(&self, key: &str);

    /// Drops every expired entry. Returns how many were removed.
    fn delete_expired(&self) -> usize;
}
