//! Cache store implementation
//!
//! Generic in-memory cache with per-entry TTL and explicit invalidation.
//! Expired entries are treated as absent on read and removed lazily or by
//! the periodic sweep.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A cached value with its timestamp and lifetime
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has outlived its TTL
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Keyed cache with per-entry expiry
pub struct TtlCache<K, V> {
    /// Name used in log lines
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get a value if present and not expired
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache = self.name, key = ?key, "Cache hit");
                return Some(entry.value.clone());
            }
            // Release the shard guard before removing
            drop(entry);
            if self.entries.remove_if(key, |_, e| e.is_expired()).is_some() {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache = self.name, key = ?key, "Cache miss");
        None
    }

    /// Store a value stamped now
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        debug!(cache = self.name, key = ?key, ttl_secs = ttl.as_secs(), "Cache set");
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    /// Remove an entry unconditionally
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(cache = self.name, key = ?key, "Cache invalidated");
        }
        removed
    }

    /// Invalidate every entry whose key matches the predicate
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        let count = before.saturating_sub(self.entries.len());

        if count > 0 {
            self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
            debug!(cache = self.name, count = count, "Invalidated cache entries");
        }
        count
    }

    /// Remove expired entries
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());

        if count > 0 {
            self.expirations.fetch_add(count as u64, Ordering::Relaxed);
            debug!(cache = self.name, count = count, "Swept expired cache entries");
        }
        count
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.clear();
        info!(cache = self.name, "Cache cleared");
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a background task that sweeps expired entries on an interval.
///
/// The returned handle is aborted on session teardown.
pub fn spawn_sweep_task<K, V>(cache: Arc<TtlCache<K, V>>, interval: Duration) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    info!(cache = cache.name(), interval_secs = interval.as_secs(), "Cache sweep task started");

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = cache.sweep();
            let stats = cache.stats();
            debug!(
                cache = cache.name(),
                removed = removed,
                entries = stats.entries,
                hit_rate = %format!("{:.1}%", stats.hit_rate()),
                "Cache sweep completed"
            );
        }
    })
}
