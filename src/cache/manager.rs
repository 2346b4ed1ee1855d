//! Cache Manager
//!
//! Explicit owner of the cache subsystem. Built once at startup, shared by
//! reference (or `Arc`) with every consumer, and shut down explicitly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{DistributedBackend, InMemoryBackend};
use super::l1::{BoundedLocalCache, L1Config};
use super::l2::{DistributedCache, L2Config};
use super::l3::{EdgeBackend, EdgeCache, L3Config};
use super::metrics::RecommendationThresholds;
use super::policy::{CacheTier, KeyMatcher, PolicyTable};
use super::redis_backend::DiscoveryMode;
use super::strategy::{CacheStrategy, InvalidationReport, StrategyStats};
use super::wrap::Memoized;
use crate::error::{BoxError, Result};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 configuration
    pub l1: L1Config,
    /// L2 configuration
    pub l2: L2Config,
    /// L3 configuration
    pub l3: L3Config,
    /// Data-type routing
    pub policies: PolicyTable,
    /// How the Redis primary is chosen
    pub discovery: DiscoveryMode,
    /// Period of the expired-entry sweeper (None disables it)
    pub sweep_interval: Option<Duration>,
    pub thresholds: RecommendationThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: L2Config::default(),
            l3: L3Config::default(),
            policies: PolicyTable::standard(),
            discovery: DiscoveryMode::default(),
            sweep_interval: Some(Duration::from_secs(30)),
            thresholds: RecommendationThresholds::default(),
        }
    }
}

/// Unified cache manager
pub struct CacheManager {
    strategy: Arc<CacheStrategy>,
    config: CacheConfig,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build every tier from configuration and start the sweeper.
    ///
    /// Fails only on invalid configuration; unreachable backends leave the
    /// affected tier degraded.
    pub async fn init(config: CacheConfig) -> Result<Self> {
        let discovery = config.discovery.strategy();
        let l2 = DistributedCache::connect(config.l2.clone(), discovery.as_ref()).await?;
        let l3 = EdgeCache::from_config(config.l3.clone())?;
        Ok(Self::assemble(config, l2, l3))
    }

    /// Build over injected backends (`None` edge = tier disabled)
    pub fn with_backends(
        config: CacheConfig,
        l2_backend: Arc<dyn DistributedBackend>,
        edge_backend: Option<Arc<dyn EdgeBackend>>,
    ) -> Self {
        let l2 = DistributedCache::with_backend(config.l2.clone(), l2_backend);
        let l3 = EdgeCache::new(config.l3.clone(), edge_backend);
        Self::assemble(config, l2, l3)
    }

    /// Create with in-memory L2 and no edge (for testing and local development)
    pub fn in_memory() -> Self {
        Self::with_backends(
            CacheConfig::default(),
            Arc::new(InMemoryBackend::new()),
            None,
        )
    }

    fn assemble(config: CacheConfig, l2: DistributedCache, l3: EdgeCache) -> Self {
        let l1 = BoundedLocalCache::with_config(config.l1.clone());

        info!(
            l1_max_entries = config.l1.max_entries,
            l1_max_bytes = config.l1.max_bytes,
            l2_backend = l2.stats().backend,
            l2_pool_size = config.l2.pool_size,
            l3_enabled = l3.is_enabled(),
            policies = config.policies.len(),
            "Cache manager initialized"
        );

        let strategy = Arc::new(
            CacheStrategy::new(
                Arc::new(l1),
                Arc::new(l2),
                Arc::new(l3),
                config.policies.clone(),
            )
            .with_thresholds(config.thresholds.clone()),
        );

        let shutdown = CancellationToken::new();
        let sweeper = config
            .sweep_interval
            .and_then(|interval| spawn_sweeper(strategy.clone(), interval, shutdown.clone()));

        Self {
            strategy,
            config,
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Stop the sweeper, log final statistics and clear L1
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        let stats = self.strategy.stats();
        info!(
            requests = stats.router.request_count,
            hit_rate = stats.router.hit_rate,
            l1_entries = stats.l1.entries,
            l2_errors = stats.l2.errors,
            "Cache manager shut down"
        );
        self.strategy.l1().invalidate(None);
    }

    // =========================================================================
    // Delegated operations
    // =========================================================================

    pub async fn get<V>(&self, key: &str, data_type: &str, tiers: Option<&[CacheTier]>) -> Option<V>
    where
        V: DeserializeOwned,
    {
        self.strategy.get(key, data_type, tiers).await
    }

    pub async fn get_or_compute<V, F, Fut, E>(
        &self,
        key: &str,
        data_type: &str,
        tiers: Option<&[CacheTier]>,
        compute: F,
    ) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<BoxError>,
    {
        self.strategy
            .get_or_compute(key, data_type, tiers, compute)
            .await
    }

    pub async fn set<V>(
        &self,
        key: &str,
        value: &V,
        data_type: &str,
        tiers: Option<&[CacheTier]>,
    ) -> Result<()>
    where
        V: Serialize + ?Sized,
    {
        self.strategy.set(key, value, data_type, tiers).await
    }

    pub async fn invalidate(
        &self,
        matcher: &KeyMatcher,
        tiers: Option<&[CacheTier]>,
    ) -> InvalidationReport {
        self.strategy.invalidate(matcher, tiers).await
    }

    pub async fn delete(&self, keys: &[String], tiers: Option<&[CacheTier]>) -> u64 {
        self.strategy.delete(keys, tiers).await
    }

    pub async fn warm_edge(&self, keys: &[String]) -> usize {
        self.strategy.warm_edge(keys).await
    }

    /// Memoize `func` under `data_type`'s policy
    pub fn wrap<F>(&self, func: F, data_type: impl Into<String>, key_prefix: Option<&str>) -> Memoized<F> {
        self.strategy.wrap(func, data_type, key_prefix)
    }

    pub fn stats(&self) -> StrategyStats {
        self.strategy.stats()
    }

    /// True if the distributed tier answers a ping
    pub async fn health_check(&self) -> bool {
        self.strategy.l2().health_check().await
    }

    /// Shared router handle
    pub fn strategy(&self) -> &Arc<CacheStrategy> {
        &self.strategy
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Periodically purge expired L1 entries until `token` is cancelled
fn spawn_sweeper(
    strategy: Arc<CacheStrategy>,
    interval: Duration,
    token: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime, expired-entry sweeper not started");
        return None;
    };

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = strategy.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Swept expired L1 entries");
                    }
                }
            }
        }
        debug!("Sweeper stopped");
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let manager = CacheManager::in_memory();

        manager
            .set("user_profile:u1", "Ada Lovelace", "user_profile", None)
            .await
            .unwrap();
        let name: Option<String> = manager.get("user_profile:u1", "user_profile", None).await;
        assert_eq!(name.as_deref(), Some("Ada Lovelace"));
        assert!(manager.health_check().await);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired() {
        let config = CacheConfig {
            sweep_interval: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let manager = CacheManager::with_backends(config, Arc::new(InMemoryBackend::new()), None);

        // quote: 1s TTL, lives in L1
        manager.set("quote:AAPL", &187.0f64, "quote", None).await.unwrap();
        assert_eq!(manager.strategy().l1().len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(manager.strategy().l1().len(), 0);
        assert_eq!(manager.stats().l1.expirations, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_l1_and_stops_sweeper() {
        let manager = CacheManager::in_memory();
        manager.set("quote:AAPL", &1u32, "quote", None).await.unwrap();

        manager.shutdown().await;

        assert!(manager.strategy().l1().is_empty());
        assert!(manager.sweeper.lock().is_none());
        // L2 is shared state and survives
        let price: Option<u32> = manager.get("quote:AAPL", "quote", None).await;
        assert_eq!(price, Some(1));
    }

    #[test]
    fn test_without_runtime_no_sweeper() {
        let manager = CacheManager::in_memory();
        assert!(manager.sweeper.lock().is_none());
    }

    #[tokio::test]
    async fn test_init_rejects_empty_endpoints() {
        let mut config = CacheConfig::default();
        config.l2.endpoints.clear();
        assert_matches!(CacheManager::init(config).await, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_init_with_unreachable_redis_degrades() {
        let mut config = CacheConfig::default();
        config.l2.endpoints = vec!["redis://127.0.0.1:1".to_string()];
        config.l2.op_timeout = Duration::from_millis(100);

        let manager = CacheManager::init(config).await.unwrap();
        let value: u32 = manager
            .get_or_compute("holdings:u1", "holdings", None, || async { Ok::<_, Error>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(manager.stats().l2.errors + manager.stats().l2.timeouts >= 2);

        manager.shutdown().await;
    }
}
