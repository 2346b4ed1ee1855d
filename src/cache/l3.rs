//! L3 Cache - Edge Tier
//!
//! Best-effort pushes, purges and warm-ups against an edge network. The edge
//! is never authoritative and has no read path through the router.
//!
//! # Design
//!
//! - Pluggable [`EdgeBackend`] (HTTP fan-out in production, in-memory for tests)
//! - No backend configured means the tier is disabled and every call is a no-op
//! - Every call is bounded by a short timeout; failures are logged and counted,
//!   never returned

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::policy::{KeyMatcher, MatchMode};
use crate::error::{Error, Result};

/// Content type used for packed router values
pub const PACKED_CONTENT_TYPE: &str = "application/msgpack";

/// Default per-call edge deadline
pub const DEFAULT_EDGE_TIMEOUT: Duration = Duration::from_millis(500);

/// Edge network backend
#[async_trait]
pub trait EdgeBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Push a value to the edge
    async fn push(&self, key: &str, body: Bytes, content_type: &str, ttl: Duration) -> Result<()>;

    /// Purge keys accepted by `matcher`
    async fn invalidate(&self, matcher: &KeyMatcher) -> Result<()>;

    /// Ask the edge to pull `key` ahead of traffic
    async fn warm(&self, key: &str) -> Result<()>;
}

// =============================================================================
// HTTP Edge Backend
// =============================================================================

#[derive(Debug, Serialize)]
struct PurgeRequest<'a> {
    pattern: &'a str,
    mode: MatchMode,
}

/// Edge backend speaking a simple HTTP cache API on every endpoint
///
/// - `PUT {endpoint}/cache/{key}` to push
/// - `POST {endpoint}/purge` with `{"pattern": .., "mode": ..}` to invalidate
/// - `GET {endpoint}/cache/{key}` to warm
pub struct HttpEdgeBackend {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpEdgeBackend {
    /// Create a backend fanning out to `endpoints`
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("no edge endpoints configured".into()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoints = endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Run `call` against every endpoint concurrently
    async fn fan_out<F, Fut>(&self, operation: &str, call: F) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let results = join_all(self.endpoints.iter().map(|ep| call(ep.clone()))).await;

        let failures: Vec<String> = results
            .into_iter()
            .zip(&self.endpoints)
            .filter_map(|(result, ep)| result.err().map(|e| format!("{}: {}", ep, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "edge {} failed on {}/{} endpoints ({})",
                operation,
                failures.len(),
                self.endpoints.len(),
                failures.join("; ")
            )))
        }
    }
}

fn cache_url(endpoint: &str, key: &str) -> String {
    format!("{}/cache/{}", endpoint, urlencoding::encode(key))
}

/// One year, the longest max-age edges are expected to honour
const MAX_EDGE_AGE_SECS: u64 = 365 * 24 * 60 * 60;

/// `Cache-Control` for a push. A zero TTL never expires; partial seconds
/// round up so short TTLs are still cached.
fn cache_control(ttl: Duration) -> String {
    let secs = if ttl.is_zero() {
        MAX_EDGE_AGE_SECS
    } else {
        (ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).min(MAX_EDGE_AGE_SECS)
    };
    format!("max-age={}", secs)
}

#[async_trait]
impl EdgeBackend for HttpEdgeBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn push(&self, key: &str, body: Bytes, content_type: &str, ttl: Duration) -> Result<()> {
        self.fan_out("push", |ep| {
            let request = self
                .client
                .put(cache_url(&ep, key))
                .header(CONTENT_TYPE, content_type)
                .header(CACHE_CONTROL, cache_control(ttl))
                .body(body.clone());
            async move {
                request.send().await?.error_for_status()?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    async fn invalidate(&self, matcher: &KeyMatcher) -> Result<()> {
        let purge = PurgeRequest {
            pattern: &matcher.pattern,
            mode: matcher.mode,
        };
        self.fan_out("purge", |ep| {
            let request = self.client.post(format!("{}/purge", ep)).json(&purge);
            async move {
                request.send().await?.error_for_status()?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    async fn warm(&self, key: &str) -> Result<()> {
        self.fan_out("warm", |ep| {
            let request = self.client.get(cache_url(&ep, key));
            async move {
                request.send().await?.error_for_status()?;
                Ok::<(), Error>(())
            }
        })
        .await
    }
}

// =============================================================================
// In-Memory Edge Backend
// =============================================================================

/// In-memory edge backend for tests and local development
pub struct InMemoryEdgeBackend {
    objects: DashMap<String, Bytes>,
    purges: Mutex<Vec<KeyMatcher>>,
    warmed: Mutex<Vec<String>>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl Default for InMemoryEdgeBackend {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            purges: Mutex::new(Vec::new()),
            warmed: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
        }
    }
}

impl InMemoryEdgeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the edge going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (None to disable)
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Pushed object for `key`
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|v| v.clone())
    }

    /// Number of objects currently held
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Purges received so far
    pub fn purges(&self) -> Vec<KeyMatcher> {
        self.purges.lock().clone()
    }

    /// Keys warmed so far
    pub fn warmed(&self) -> Vec<String> {
        self.warmed.lock().clone()
    }

    async fn simulate_network(&self) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Connection("in-memory edge marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EdgeBackend for InMemoryEdgeBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn push(&self, key: &str, body: Bytes, _content_type: &str, _ttl: Duration) -> Result<()> {
        self.simulate_network().await?;
        self.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn invalidate(&self, matcher: &KeyMatcher) -> Result<()> {
        self.simulate_network().await?;
        self.objects.retain(|key, _| !matcher.matches(key));
        self.purges.lock().push(matcher.clone());
        Ok(())
    }

    async fn warm(&self, key: &str) -> Result<()> {
        self.simulate_network().await?;
        self.warmed.lock().push(key.to_string());
        Ok(())
    }
}

// =============================================================================
// Edge Cache
// =============================================================================

/// L3 cache configuration
#[derive(Debug, Clone)]
pub struct L3Config {
    /// Edge endpoint base URLs; empty disables the tier
    pub endpoints: Vec<String>,
    /// Per-call deadline
    pub timeout: Duration,
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout: DEFAULT_EDGE_TIMEOUT,
        }
    }
}

/// L3 Cache - best-effort edge tier
pub struct EdgeCache {
    backend: Option<Arc<dyn EdgeBackend>>,
    config: L3Config,
    pushes: AtomicU64,
    invalidations: AtomicU64,
    warmed: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl EdgeCache {
    /// Create over an explicit backend (`None` = disabled)
    pub fn new(config: L3Config, backend: Option<Arc<dyn EdgeBackend>>) -> Self {
        Self {
            backend,
            config,
            pushes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            warmed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Disabled edge tier
    pub fn disabled() -> Self {
        Self::new(L3Config::default(), None)
    }

    /// HTTP edge tier from configuration; disabled when no endpoints are set
    pub fn from_config(config: L3Config) -> Result<Self> {
        if config.endpoints.is_empty() {
            info!("L3 edge tier disabled (no endpoints)");
            return Ok(Self::new(config, None));
        }
        let backend = HttpEdgeBackend::new(config.endpoints.clone(), config.timeout)?;
        info!(endpoints = config.endpoints.len(), "L3 edge tier enabled");
        Ok(Self::new(config, Some(Arc::new(backend))))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &L3Config {
        &self.config
    }

    /// Run a backend call under the edge deadline, absorbing failures
    async fn guarded<F>(&self, operation: &'static str, key: &str, fut: F) -> bool
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(operation, key, error = %e, "Edge call failed");
                false
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(operation, key, after = ?self.config.timeout, "Edge call timed out");
                false
            }
        }
    }

    /// Push a value to the edge
    pub async fn push(&self, key: &str, value: Bytes, content_type: &str, ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };
        if self
            .guarded("l3.push", key, backend.push(key, value, content_type, ttl))
            .await
        {
            self.pushes.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Pushed to edge");
        }
    }

    /// Purge keys accepted by `matcher`
    pub async fn invalidate(&self, matcher: &KeyMatcher) {
        let Some(backend) = &self.backend else {
            return;
        };
        if self
            .guarded("l3.invalidate", &matcher.pattern, backend.invalidate(matcher))
            .await
        {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Warm `keys` concurrently, returning how many succeeded
    pub async fn warm(&self, keys: &[String]) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };
        let results = join_all(
            keys.iter()
                .map(|key| self.guarded("l3.warm", key, backend.warm(key))),
        )
        .await;

        let warmed = results.into_iter().filter(|ok| *ok).count();
        self.warmed.fetch_add(warmed as u64, Ordering::Relaxed);
        warmed
    }

    /// Get cache statistics
    pub fn stats(&self) -> EdgeStats {
        EdgeStats {
            enabled: self.is_enabled(),
            backend: self.backend.as_ref().map(|b| b.name()),
            pushes: self.pushes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            warmed: self.warmed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// L3 cache statistics
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EdgeStats {
    pub enabled: bool,
    /// Backend name when enabled
    pub backend: Option<&'static str>,
    /// Successful pushes
    pub pushes: u64,
    /// Successful purges
    pub invalidations: u64,
    /// Successfully warmed keys
    pub warmed: u64,
    /// Failed calls (excluding timeouts)
    pub failures: u64,
    pub timeouts: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn make_edge() -> (Arc<InMemoryEdgeBackend>, EdgeCache) {
        let backend = Arc::new(InMemoryEdgeBackend::new());
        let edge = EdgeCache::new(L3Config::default(), Some(backend.clone()));
        (backend, edge)
    }

    #[tokio::test]
    async fn test_disabled_edge_is_noop() {
        let edge = EdgeCache::disabled();
        assert!(!edge.is_enabled());

        edge.push("k", Bytes::from_static(b"v"), PACKED_CONTENT_TYPE, Duration::from_secs(1))
            .await;
        edge.invalidate(&KeyMatcher::prefix("k")).await;
        assert_eq!(edge.warm(&["k".to_string()]).await, 0);

        let stats = edge.stats();
        assert_eq!(stats.pushes, 0);
        assert_eq!(stats.backend, None);
    }

    #[test]
    fn test_from_config_without_endpoints_is_disabled() {
        let edge = EdgeCache::from_config(L3Config::default()).unwrap();
        assert!(!edge.is_enabled());
    }

    #[tokio::test]
    async fn test_push_invalidate_warm() {
        let (backend, edge) = make_edge();

        edge.push(
            "security_info:AAPL",
            Bytes::from_static(b"v"),
            PACKED_CONTENT_TYPE,
            Duration::from_secs(3600),
        )
        .await;
        edge.push(
            "historical_data:AAPL",
            Bytes::from_static(b"v"),
            PACKED_CONTENT_TYPE,
            Duration::from_secs(1800),
        )
        .await;
        assert_eq!(backend.len(), 2);

        edge.invalidate(&KeyMatcher::prefix("security_info:")).await;
        assert!(backend.object("security_info:AAPL").is_none());
        assert!(backend.object("historical_data:AAPL").is_some());

        let warmed = edge
            .warm(&["security_info:MSFT".to_string(), "security_info:GOOG".to_string()])
            .await;
        assert_eq!(warmed, 2);

        let stats = edge.stats();
        assert_eq!(stats.pushes, 2);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.warmed, 2);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        let (backend, edge) = make_edge();
        backend.set_available(false);

        edge.push("k", Bytes::from_static(b"v"), PACKED_CONTENT_TYPE, Duration::from_secs(1))
            .await;
        edge.invalidate(&KeyMatcher::contains("k")).await;

        let stats = edge.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.pushes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_edge_times_out() {
        let (backend, edge) = make_edge();
        backend.set_latency(Some(Duration::from_secs(5)));

        let start = Instant::now();
        edge.push("k", Bytes::from_static(b"v"), PACKED_CONTENT_TYPE, Duration::from_secs(1))
            .await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(edge.stats().timeouts, 1);
    }

    #[test]
    fn test_cache_url_encodes_key() {
        assert_eq!(
            cache_url("https://edge.example.com", "quote:BRK B"),
            "https://edge.example.com/cache/quote%3ABRK%20B"
        );
    }

    #[test]
    fn test_cache_control_max_age() {
        assert_eq!(cache_control(Duration::from_secs(300)), "max-age=300");
        assert_eq!(cache_control(Duration::from_millis(500)), "max-age=1");
        assert_eq!(cache_control(Duration::from_millis(1500)), "max-age=2");
        // zero means no expiry, never "do not cache"
        assert_eq!(cache_control(Duration::ZERO), "max-age=31536000");
    }

    #[test]
    fn test_http_backend_requires_endpoints() {
        assert!(HttpEdgeBackend::new(vec![], DEFAULT_EDGE_TIMEOUT).is_err());

        let backend =
            HttpEdgeBackend::new(vec!["https://edge.example.com/".into()], DEFAULT_EDGE_TIMEOUT)
                .unwrap();
        assert_eq!(backend.endpoints(), ["https://edge.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_http_edge_is_absorbed() {
        let config = L3Config {
            endpoints: vec!["http://127.0.0.1:1".into()],
            timeout: Duration::from_millis(200),
        };
        let edge = EdgeCache::from_config(config).unwrap();

        edge.push("k", Bytes::from_static(b"v"), PACKED_CONTENT_TYPE, Duration::from_secs(1))
            .await;
        let stats = edge.stats();
        assert_eq!(stats.pushes, 0);
        assert_eq!(stats.failures + stats.timeouts, 1);
    }
}
