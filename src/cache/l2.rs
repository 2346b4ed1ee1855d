//! L2 Cache - Distributed Tier
//!
//! Networked cache shared by every application instance. Payloads are the
//! packed values from the router, wrapped by [`PayloadCodec`] (LZ4 above the
//! compression threshold).
//!
//! # Design
//!
//! - A semaphore sized to the pool bounds concurrent backend calls; callers
//!   queue for a permit instead of failing
//! - Each call runs under `op_timeout`, and the wait for a permit counts
//!   against that deadline
//! - Backend errors and timeouts are logged and absorbed: reads become misses,
//!   writes become no-ops
//! - Payloads that cannot be decoded are deleted and reported as misses

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::backend::DistributedBackend;
use super::compression::{PayloadCodec, DEFAULT_COMPRESSION_THRESHOLD};
use super::policy::KeyMatcher;
use super::redis_backend::{PrimaryDiscovery, RedisBackend};
use crate::error::{Error, Result};

/// L2 cache configuration
#[derive(Debug, Clone)]
pub struct L2Config {
    /// Redis endpoint URLs (primary chosen by discovery)
    pub endpoints: Vec<String>,
    /// Maximum concurrent backend calls
    pub pool_size: usize,
    /// Packed payloads larger than this are compressed
    pub compression_threshold: usize,
    /// TTL used when the caller does not give one
    pub default_ttl: Duration,
    /// Deadline for get/set/delete
    pub op_timeout: Duration,
    /// Deadline for a whole pattern invalidation
    pub scan_timeout: Duration,
    /// Keys per SCAN batch
    pub scan_batch_size: usize,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            endpoints: vec!["redis://127.0.0.1:6379".to_string()],
            pool_size: 16,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            default_ttl: Duration::from_secs(300),
            op_timeout: Duration::from_millis(250),
            scan_timeout: Duration::from_secs(5),
            scan_batch_size: 500,
        }
    }
}

/// L2 Cache - distributed tier
pub struct DistributedCache {
    backend: Arc<dyn DistributedBackend>,
    codec: PayloadCodec,
    permits: Semaphore,
    config: L2Config,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    compressed_writes: AtomicU64,
    bytes_written: AtomicU64,
}

impl DistributedCache {
    /// Connect to Redis using `discovery` to choose the primary.
    ///
    /// Only configuration problems are errors. An unreachable backend is
    /// logged and the tier starts degraded.
    pub async fn connect(config: L2Config, discovery: &dyn PrimaryDiscovery) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(Error::Config("L2 pool_size must be at least 1".into()));
        }
        let backend = RedisBackend::connect(&config.endpoints, config.pool_size, discovery).await?;
        let endpoint = backend.endpoint().to_string();
        let cache = Self::with_backend(config, Arc::new(backend));

        if cache.health_check().await {
            info!(endpoint = %endpoint, "L2 connected");
        } else {
            warn!(endpoint = %endpoint, "L2 backend unreachable, starting degraded");
        }
        Ok(cache)
    }

    /// Build over an already constructed backend
    pub fn with_backend(config: L2Config, backend: Arc<dyn DistributedBackend>) -> Self {
        Self {
            backend,
            codec: PayloadCodec::new(config.compression_threshold),
            permits: Semaphore::new(config.pool_size.max(1)),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            compressed_writes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Wait for a pool permit and run `fut`, all within `deadline`
    async fn call<T, F>(&self, operation: &'static str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permitted = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::Internal("L2 pool closed".into()))?;
            fut.await
        };

        match tokio::time::timeout(deadline, permitted).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation,
                after: deadline,
            }),
        }
    }

    fn record_failure(&self, operation: &'static str, key: &str, err: &Error) {
        if matches!(err, Error::Timeout { .. }) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        warn!(
            operation,
            key,
            backend = self.backend.name(),
            error = %err,
            "L2 call failed, continuing without it"
        );
    }

    /// Get the packed value for `key`
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let result = self
            .call("l2.get", self.config.op_timeout, self.backend.get(key))
            .await;

        let wire = match result {
            Ok(Some(wire)) => wire,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.record_failure("l2.get", key, &e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match self.codec.decode(&wire) {
            Ok(packed) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(packed)
            }
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable L2 payload");
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.delete(&[key.to_string()]).await;
                None
            }
        }
    }

    /// Store a packed value. `None` uses the configured default TTL.
    pub async fn set(&self, key: &str, packed: &[u8], ttl: Option<Duration>) {
        let wire = match self.codec.encode(packed) {
            Ok(wire) => wire,
            Err(e) => {
                self.record_failure("l2.encode", key, &e);
                return;
            }
        };

        let compressed = PayloadCodec::is_compressed(&wire);
        let wire_len = wire.len() as u64;
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        let result = self
            .call("l2.set", self.config.op_timeout, self.backend.set(key, wire, ttl))
            .await;

        match result {
            Ok(()) => {
                if compressed {
                    self.compressed_writes.fetch_add(1, Ordering::Relaxed);
                }
                self.bytes_written.fetch_add(wire_len, Ordering::Relaxed);
                debug!(key, bytes = wire_len, compressed, "L2 set");
            }
            Err(e) => self.record_failure("l2.set", key, &e),
        }
    }

    /// Delete exact keys, returning how many existed (0 on failure)
    pub async fn delete(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        match self
            .call("l2.delete", self.config.op_timeout, self.backend.delete(keys))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                self.record_failure("l2.delete", &keys.join(","), &e);
                0
            }
        }
    }

    /// Delete every key accepted by `matcher` in bounded batches
    #[instrument(skip(self), fields(pattern = %matcher))]
    pub async fn invalidate_pattern(&self, matcher: &KeyMatcher) -> u64 {
        let scan = self
            .backend
            .scan_and_delete(matcher, self.config.scan_batch_size);

        match self.call("l2.invalidate", self.config.scan_timeout, scan).await {
            Ok(removed) => {
                debug!(removed, "L2 pattern invalidated");
                removed
            }
            Err(e) => {
                self.record_failure("l2.invalidate", &matcher.pattern, &e);
                0
            }
        }
    }

    /// True if the backend answers a ping within the operation timeout
    pub async fn health_check(&self) -> bool {
        match self
            .call("l2.ping", self.config.op_timeout, self.backend.ping())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "L2 health check failed");
                false
            }
        }
    }

    pub fn config(&self) -> &L2Config {
        &self.config
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> L2Stats {
        L2Stats {
            backend: self.backend.name(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            pool_size: self.config.pool_size.max(1),
            available_permits: self.permits.available_permits(),
        }
    }
}

/// L2 cache statistics
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct L2Stats {
    /// Backend name
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Backend and decode errors (excluding timeouts)
    pub errors: u64,
    pub timeouts: u64,
    /// Writes that went out LZ4-compressed
    pub compressed_writes: u64,
    /// Wire bytes successfully written
    pub bytes_written: u64,
    pub pool_size: usize,
    /// Pool permits not currently held
    pub available_permits: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::InMemoryBackend;
    use crate::cache::compression::COMPRESSION_MARKER;
    use tokio::time::Instant;

    fn make_cache(config: L2Config) -> (Arc<InMemoryBackend>, DistributedCache) {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = DistributedCache::with_backend(config, backend.clone());
        (backend, cache)
    }

    #[tokio::test]
    async fn test_small_payload_stored_raw() {
        let (backend, cache) = make_cache(L2Config::default());

        cache.set("quote:AAPL", b"187.42", None).await;

        assert_eq!(backend.raw("quote:AAPL"), Some(b"187.42".to_vec()));
        assert_eq!(cache.get("quote:AAPL").await, Some(Bytes::from_static(b"187.42")));
        assert_eq!(cache.stats().compressed_writes, 0);
    }

    #[tokio::test]
    async fn test_large_payload_compressed() {
        let (backend, cache) = make_cache(L2Config::default());
        let packed = vec![b'x'; 4096];

        cache.set("monte_carlo:u1", &packed, Some(Duration::from_secs(60))).await;

        let raw = backend.raw("monte_carlo:u1").unwrap();
        assert!(raw.starts_with(&COMPRESSION_MARKER));
        assert!(raw.len() < packed.len());
        assert_eq!(cache.get("monte_carlo:u1").await.unwrap().as_ref(), &packed[..]);

        let stats = cache.stats();
        assert_eq!(stats.compressed_writes, 1);
        assert_eq!(stats.bytes_written, raw.len() as u64);
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_absorbed() {
        let (backend, cache) = make_cache(L2Config::default());
        cache.set("holdings:u1", b"v", None).await;
        backend.set_available(false);

        assert!(cache.get("holdings:u1").await.is_none());
        cache.set("holdings:u2", b"v", None).await;
        assert_eq!(cache.delete(&["holdings:u1".to_string()]).await, 0);
        assert_eq!(cache.invalidate_pattern(&KeyMatcher::prefix("holdings:")).await, 0);
        assert!(!cache.health_check().await);

        let stats = cache.stats();
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let (backend, cache) = make_cache(L2Config::default());
        backend.insert_raw("quote:MSFT", b"v".to_vec());
        backend.set_latency(Some(Duration::from_secs(2)));

        let start = Instant::now();
        assert!(cache.get("quote:MSFT").await.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(cache.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_queues_callers() {
        let config = L2Config {
            pool_size: 1,
            ..Default::default()
        };
        let (backend, cache) = make_cache(config);
        backend.insert_raw("a", b"1".to_vec());
        backend.insert_raw("b", b"2".to_vec());
        backend.set_latency(Some(Duration::from_millis(100)));

        let start = Instant::now();
        let (a, b) = tokio::join!(cache.get("a"), cache.get("b"));

        // The second waited for the permit and still fit the deadline
        assert_eq!(a, Some(Bytes::from_static(b"1")));
        assert_eq!(b, Some(Bytes::from_static(b"2")));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(cache.stats().timeouts, 0);
        assert_eq!(cache.stats().available_permits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_wait_bounded_by_deadline() {
        let config = L2Config {
            pool_size: 1,
            ..Default::default()
        };
        let (backend, cache) = make_cache(config);
        backend.insert_raw("k", b"1".to_vec());
        backend.set_latency(Some(Duration::from_secs(30)));

        let start = Instant::now();
        let results = futures::future::join_all((0..8).map(|_| cache.get("k"))).await;

        assert!(results.iter().all(Option::is_none));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(cache.stats().timeouts, 8);
        assert_eq!(cache.stats().available_permits, 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_deleted() {
        let (backend, cache) = make_cache(L2Config::default());
        let mut corrupt = COMPRESSION_MARKER.to_vec();
        corrupt.extend_from_slice(&[100, 0, 0, 0, 0xff, 0xff, 0xff]);
        backend.insert_raw("optimization:u1", corrupt);

        assert!(cache.get("optimization:u1").await.is_none());
        assert!(backend.raw("optimization:u1").is_none());
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_only_matching() {
        let (backend, cache) = make_cache(L2Config {
            scan_batch_size: 2,
            ..Default::default()
        });
        for key in ["holdings:u1", "holdings:u2", "holdings:u3", "quote:AAPL"] {
            cache.set(key, b"v", None).await;
        }

        let removed = cache.invalidate_pattern(&KeyMatcher::prefix("holdings:")).await;

        assert_eq!(removed, 3);
        assert!(backend.raw("quote:AAPL").is_some());
        assert!(cache.get("holdings:u2").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applied() {
        let (_backend, cache) = make_cache(L2Config {
            default_ttl: Duration::from_secs(10),
            ..Default::default()
        });
        cache.set("user_profile:u1", b"v", None).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("user_profile:u1").await.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_pool() {
        let config = L2Config {
            pool_size: 0,
            ..Default::default()
        };
        let result =
            DistributedCache::connect(config, &crate::cache::redis_backend::FirstEndpoint).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
