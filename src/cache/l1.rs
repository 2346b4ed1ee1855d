//! L1 Cache - Bounded In-Process LRU
//!
//! Strict LRU cache bounded by both entry count and packed byte size.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the recency list, byte accounting and
//!   counters; no operation performs I/O while holding it
//! - Expiry is detected lazily on access (or by an optional sweeper)
//! - Eviction removes exactly as many LRU entries as needed to admit a value

use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::entry::CacheEntry;
use super::policy::KeyMatcher;
use super::{DEFAULT_L1_MAX_BYTES, DEFAULT_L1_MAX_ENTRIES};
use crate::error::{Error, Result};

/// L1 cache configuration
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total packed size in bytes
    pub max_bytes: u64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            max_bytes: DEFAULT_L1_MAX_BYTES,
        }
    }
}

/// State guarded by the L1 lock
struct L1State {
    /// Recency-ordered entries (MRU first)
    entries: LruCache<String, CacheEntry>,
    used_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl L1State {
    /// Remove an entry and release its bytes
    fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.used_bytes -= entry.size_bytes();
        Some(entry)
    }
}

/// L1 cache - bounded in-process LRU
pub struct BoundedLocalCache {
    state: Mutex<L1State>,
    config: L1Config,
}

impl BoundedLocalCache {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self {
            state: Mutex::new(L1State {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            config,
        }
    }

    /// Get the packed value for a key, refreshing its recency
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.entries.peek(key).map(|entry| entry.is_expired_at(now)) {
            None => {
                state.misses += 1;
                None
            }
            Some(true) => {
                state.take(key);
                state.expirations += 1;
                state.misses += 1;
                trace!(key, "L1 entry expired");
                None
            }
            Some(false) => {
                // get_mut moves the entry to the MRU position
                let value = state.entries.get_mut(key).map(|entry| {
                    entry.record_access();
                    entry.value().clone()
                });
                state.hits += 1;
                value
            }
        }
    }

    /// Insert a packed value, evicting LRU entries until it fits
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let size = value.len() as u64;
        if size > self.config.max_bytes {
            return Err(Error::Capacity {
                key: key.to_string(),
                size,
                max_bytes: self.config.max_bytes,
            });
        }

        let mut state = self.state.lock();

        // Replacing a key must not count against the new value's budget
        state.take(key);

        while !state.entries.is_empty()
            && (state.entries.len() >= self.config.max_entries
                || state.used_bytes + size > self.config.max_bytes)
        {
            if let Some((evicted_key, evicted)) = state.entries.pop_lru() {
                state.used_bytes -= evicted.size_bytes();
                state.evictions += 1;
                debug!(
                    key = %evicted_key,
                    size = evicted.size_bytes(),
                    "L1 evicted least-recently-used entry"
                );
            }
        }

        if self.config.max_entries == 0 {
            return Ok(());
        }

        state.used_bytes += size;
        state.entries.put(key.to_string(), CacheEntry::new(key, value, ttl));
        Ok(())
    }

    /// Remove every entry, or only those accepted by `matcher`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, matcher: Option<&KeyMatcher>) -> usize {
        let mut state = self.state.lock();

        let Some(matcher) = matcher else {
            let removed = state.entries.len();
            state.entries.clear();
            state.used_bytes = 0;
            return removed;
        };

        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| matcher.matches(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            state.take(key);
        }
        doomed.len()
    }

    /// Remove a single key
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().take(key).is_some()
    }

    /// Check if a live entry exists without touching recency or counters
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state
            .entries
            .peek(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Drop all expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.take(key);
        }
        state.expirations += expired.len() as u64;
        expired.len()
    }

    /// Keys in recency order, least recently used first
    pub fn keys_lru_first(&self) -> Vec<String> {
        let state = self.state.lock();
        state.entries.iter().rev().map(|(key, _)| key.clone()).collect()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Get bytes currently charged against the budget
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    /// Get configuration
    pub fn config(&self) -> &L1Config {
        &self.config
    }

    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        L1Stats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

impl Default for BoundedLocalCache {
    fn default() -> Self {
        Self::new()
    }
}

/// L1 cache statistics
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct L1Stats {
    /// Number of entries
    pub entries: usize,
    /// Packed bytes currently held
    pub used_bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Capacity evictions
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const NO_TTL: Duration = Duration::ZERO;

    fn small_cache(max_entries: usize, max_bytes: u64) -> BoundedLocalCache {
        BoundedLocalCache::with_config(L1Config {
            max_entries,
            max_bytes,
        })
    }

    fn value(size: usize) -> Bytes {
        Bytes::from(vec![0xAB; size])
    }

    #[test]
    fn test_set_get() {
        let cache = BoundedLocalCache::new();
        cache
            .set("quote:AAPL", Bytes::from_static(b"187.42"), Duration::from_secs(5))
            .unwrap();

        assert_eq!(cache.get("quote:AAPL").unwrap().as_ref(), b"187.42");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 6);
    }

    #[test]
    fn test_miss_tracking() {
        let cache = BoundedLocalCache::new();
        assert!(cache.get("nope").is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let cache = BoundedLocalCache::new();
        cache.set("k", value(4), NO_TTL).unwrap();

        cache.get("k");
        cache.get("k");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.75);
    }

    #[test]
    fn test_replace_adjusts_bytes() {
        let cache = BoundedLocalCache::new();
        cache.set("k", value(8), NO_TTL).unwrap();
        assert_eq!(cache.used_bytes(), 8);

        cache.set("k", value(16), NO_TTL).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 16);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let cache = small_cache(3, 1024);
        for key in ["k1", "k2", "k3", "k4"] {
            cache.set(key, value(10), NO_TTL).unwrap();
        }

        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2"));
        assert!(cache.contains("k4"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_respects_reads() {
        let cache = small_cache(3, 1024);
        cache.set("k1", value(10), NO_TTL).unwrap();
        cache.set("k2", value(10), NO_TTL).unwrap();
        cache.set("k3", value(10), NO_TTL).unwrap();

        // Re-read k1 so k2 becomes least recently used
        assert!(cache.get("k1").is_some());
        cache.set("k4", value(10), NO_TTL).unwrap();

        assert!(cache.contains("k1"));
        assert!(!cache.contains("k2"));
        assert_eq!(cache.keys_lru_first(), vec!["k3", "k1", "k4"]);
    }

    #[test]
    fn test_byte_budget_evicts_only_what_is_needed() {
        let cache = small_cache(100, 100);
        for i in 0..4 {
            cache.set(&format!("k{}", i), value(25), NO_TTL).unwrap();
        }
        assert_eq!(cache.used_bytes(), 100);

        // Needs 50 bytes: exactly two oldest entries go
        cache.set("big", value(50), NO_TTL).unwrap();
        assert_eq!(cache.stats().evictions, 2);
        assert!(!cache.contains("k0"));
        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2"));
        assert!(cache.contains("k3"));
        assert_eq!(cache.used_bytes(), 100);
    }

    #[test]
    fn test_oversized_value_rejected_without_eviction() {
        let cache = small_cache(10, 64);
        cache.set("keep", value(32), NO_TTL).unwrap();

        let err = cache.set("huge", value(65), NO_TTL).unwrap_err();
        assert_matches!(err, Error::Capacity { size: 65, max_bytes: 64, .. });

        assert!(cache.contains("keep"));
        assert!(!cache.contains("huge"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_value_equal_to_budget_fits() {
        let cache = small_cache(10, 64);
        cache.set("a", value(10), NO_TTL).unwrap();
        cache.set("full", value(64), NO_TTL).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_releases_bytes() {
        let cache = BoundedLocalCache::new();
        cache.set("quote", value(40), Duration::from_secs(2)).unwrap();

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(cache.get("quote").is_some());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cache.get("quote").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.used_bytes(), 0);

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = BoundedLocalCache::new();
        cache.set("short", value(10), Duration::from_secs(1)).unwrap();
        cache.set("long", value(10), Duration::from_secs(60)).unwrap();
        cache.set("forever", value(10), NO_TTL).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.used_bytes(), 20);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = BoundedLocalCache::new();
        for i in 0..10 {
            cache.set(&format!("k{}", i), value(10), NO_TTL).unwrap();
        }

        assert_eq!(cache.invalidate(None), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = BoundedLocalCache::new();
        cache.set("user:1:profile", value(10), NO_TTL).unwrap();
        cache.set("user:1:holdings", value(20), NO_TTL).unwrap();
        cache.set("user:2:profile", value(30), NO_TTL).unwrap();

        let removed = cache.invalidate(Some(&KeyMatcher::prefix("user:1:")));
        assert_eq!(removed, 2);
        assert!(cache.contains("user:2:profile"));
        assert_eq!(cache.used_bytes(), 30);
    }

    #[test]
    fn test_invalidate_contains() {
        let cache = BoundedLocalCache::new();
        cache.set("quote:AAPL", value(10), NO_TTL).unwrap();
        cache.set("security_info:AAPL", value(10), NO_TTL).unwrap();
        cache.set("quote:MSFT", value(10), NO_TTL).unwrap();

        let removed = cache.invalidate(Some(&KeyMatcher::contains("AAPL")));
        assert_eq!(removed, 2);
        assert!(cache.contains("quote:MSFT"));
    }

    #[test]
    fn test_remove() {
        let cache = BoundedLocalCache::new();
        cache.set("k", value(10), NO_TTL).unwrap();

        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(small_cache(500, 64 * 1024));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = format!("obj-{}-{}", t, i);
                        cache.set(&key, value(64), NO_TTL).unwrap();
                        cache.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = cache.stats();
        assert!(stats.entries <= 500);
        assert!(stats.used_bytes <= 64 * 1024);
    }
}
