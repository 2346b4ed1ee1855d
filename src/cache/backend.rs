//! Distributed Backend Interface
//!
//! One asynchronous interface over the networked store behind L2. A deployment
//! picks one implementation: [`RedisBackend`](super::redis_backend::RedisBackend)
//! in production, [`InMemoryBackend`] for tests and local development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::policy::KeyMatcher;
use crate::error::{Error, Result};

/// Networked store used by the distributed tier
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Fetch a wire payload
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a wire payload (zero TTL = no expiry)
    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Delete every key accepted by `matcher`, scanning `batch_size` keys at a time
    async fn scan_and_delete(&self, matcher: &KeyMatcher, batch_size: usize) -> Result<u64>;

    /// Round-trip check
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Debug, Clone)]
struct StoredPayload {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredPayload {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// In-process stand-in for Redis with fault injection
///
/// Uses DashMap for sharded concurrent access. `set_available(false)`
/// makes every call fail with a connection error; `set_latency` delays every
/// call to exercise timeouts.
pub struct InMemoryBackend {
    storage: DashMap<String, StoredPayload>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    scan_batches: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scan_batches: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (None to disable)
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Raw stored payload, bypassing fault injection
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.storage
            .get(key)
            .filter(|stored| !stored.is_expired())
            .map(|stored| stored.payload.clone())
    }

    /// Store a raw payload, bypassing fault injection
    pub fn insert_raw(&self, key: &str, payload: Vec<u8>) {
        self.storage.insert(
            key.to_string(),
            StoredPayload {
                payload,
                expires_at: None,
            },
        );
    }

    /// Number of stored keys (including not-yet-collected expired ones)
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of batches processed by `scan_and_delete`
    pub fn scan_batches(&self) -> u64 {
        self.scan_batches.load(Ordering::Relaxed)
    }

    async fn simulate_network(&self) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Connection("in-memory backend marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.simulate_network().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let expired = match self.storage.get(key) {
            None => return Ok(None),
            Some(stored) if !stored.is_expired() => return Ok(Some(stored.payload.clone())),
            Some(_) => true,
        };
        if expired {
            self.storage.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        self.simulate_network().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.storage
            .insert(key.to_string(), StoredPayload { payload, expires_at });
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.simulate_network().await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let removed = keys
            .iter()
            .filter(|key| self.storage.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn scan_and_delete(&self, matcher: &KeyMatcher, batch_size: usize) -> Result<u64> {
        self.simulate_network().await?;

        let batch_size = batch_size.max(1);
        let mut removed = 0u64;
        loop {
            let batch: Vec<String> = self
                .storage
                .iter()
                .filter(|item| matcher.matches(item.key()))
                .take(batch_size)
                .map(|item| item.key().clone())
                .collect();

            if batch.is_empty() {
                break;
            }
            self.scan_batches.fetch_add(1, Ordering::Relaxed);
            for key in &batch {
                if self.storage.remove(key).is_some() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.simulate_network().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = InMemoryBackend::new();

        backend.set("k", b"payload".to_vec(), Duration::ZERO).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"payload".to_vec()));

        let removed = backend
            .delete(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_scan_and_delete_in_batches() {
        let backend = InMemoryBackend::new();
        for i in 0..25 {
            backend.insert_raw(&format!("holdings:{}", i), vec![1]);
        }
        backend.insert_raw("quote:AAPL", vec![2]);

        let removed = backend
            .scan_and_delete(&KeyMatcher::prefix("holdings:"), 10)
            .await
            .unwrap();

        assert_eq!(removed, 25);
        assert_eq!(backend.scan_batches(), 3);
        assert_eq!(backend.len(), 1);
        assert!(backend.raw("quote:AAPL").is_some());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails() {
        let backend = InMemoryBackend::new();
        backend.set_available(false);

        let err = backend.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(backend.ping().await.is_err());

        backend.set_available(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_injection() {
        let backend = InMemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(1)));

        let start = Instant::now();
        backend.ping().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
