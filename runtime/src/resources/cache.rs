//! Resource cache: a process-wide key/value store with a fixed TTL.
//!
//! ## Expiry
//!
//! Every entry lives for the cache's TTL from the moment it was written.
//! Expired entries read as absent and are dropped on that read;
//! [`ResourceCache::purge_expired`] sweeps the rest from a maintenance task.
//! Writes to the same key are last-writer-wins.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default TTL for cached filter decisions (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache entry with its insertion time.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    cached_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) >= ttl
    }
}

/// Concurrent TTL cache shared by every render in the process.
#[derive(Debug)]
pub struct ResourceCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone> ResourceCache<V> {
    /// Create an empty cache whose entries expire `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get the value for `key` if it exists and has not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(self.ttl, now) {
                return Some(entry.value.clone());
            }
        }
        // Re-check under the write lock: another task may have refreshed it.
        self.entries
            .remove_if(key, |_, entry| entry.is_expired(self.ttl, now));
        None
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_expired(self.ttl, now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries (including expired ones not yet purged).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The fixed TTL applied to every entry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
