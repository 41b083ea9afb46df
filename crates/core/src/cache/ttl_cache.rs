use dashmap::DashMap;
use log::debug;
use std::time::{Duration, Instant};

use super::cache_traits::CacheStore;
use crate::errors::Result;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// `None` when the TTL is too large to represent; such entries never expire.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// In-process TTL cache backed by a sharded concurrent map.
///
/// Expired entries are dropped lazily on `get` and in bulk by `delete_expired`.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheStore<V> for TtlCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // The read guard is released above; re-check under the write lock so a
        // concurrent `set` of a fresh value is not removed.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn delete_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Removed {} expired cache entries", removed);
        }
        removed
    }
}
