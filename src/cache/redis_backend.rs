//! Redis Backend
//!
//! Production [`DistributedBackend`] over a small pool of multiplexed Redis
//! connections. The endpoint to talk to is chosen by a pluggable
//! [`PrimaryDiscovery`] strategy so primary/replica topologies can be handled
//! without hardcoding a protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::backend::DistributedBackend;
use super::policy::KeyMatcher;
use crate::error::{Error, Result};

// =============================================================================
// Primary Discovery
// =============================================================================

/// Chooses which endpoint the pool connects to
#[async_trait]
pub trait PrimaryDiscovery: Send + Sync {
    /// Return the URL of the endpoint that accepts writes
    async fn discover(&self, endpoints: &[String]) -> Result<String>;
}

/// Always use the first configured endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstEndpoint;

#[async_trait]
impl PrimaryDiscovery for FirstEndpoint {
    async fn discover(&self, endpoints: &[String]) -> Result<String> {
        endpoints
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("no Redis endpoints configured".into()))
    }
}

/// Probe each endpoint with `INFO replication` and pick the one reporting
/// `role:master`
#[derive(Debug, Clone)]
pub struct ReplicationRoleDiscovery {
    /// Per-endpoint probe deadline
    pub probe_timeout: Duration,
}

impl Default for ReplicationRoleDiscovery {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
        }
    }
}

impl ReplicationRoleDiscovery {
    async fn probe(&self, endpoint: &str) -> Result<bool> {
        let client = Client::open(endpoint)?;
        let info: String = tokio::time::timeout(self.probe_timeout, async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("INFO")
                .arg("replication")
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: "redis.discover",
            after: self.probe_timeout,
        })??;

        Ok(is_primary_role(&info))
    }
}

#[async_trait]
impl PrimaryDiscovery for ReplicationRoleDiscovery {
    async fn discover(&self, endpoints: &[String]) -> Result<String> {
        for endpoint in endpoints {
            match self.probe(endpoint).await {
                Ok(true) => {
                    info!(endpoint = %endpoint, "Discovered Redis primary");
                    return Ok(endpoint.clone());
                }
                Ok(false) => debug!(endpoint = %endpoint, "Endpoint is a replica"),
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Primary probe failed"),
            }
        }
        Err(Error::Connection(format!(
            "no primary found among {} endpoints",
            endpoints.len()
        )))
    }
}

/// Configured primary discovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Use the first endpoint
    #[default]
    First,
    /// Probe `INFO replication` on each endpoint
    ReplicationRole,
}

impl DiscoveryMode {
    pub fn strategy(&self) -> Box<dyn PrimaryDiscovery> {
        match self {
            DiscoveryMode::First => Box::new(FirstEndpoint),
            DiscoveryMode::ReplicationRole => Box::new(ReplicationRoleDiscovery::default()),
        }
    }
}

/// Parse the `role:` line of an `INFO replication` reply
fn is_primary_role(info: &str) -> bool {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("role:"))
        .any(|role| role == "master")
}

// =============================================================================
// Redis Backend
// =============================================================================

/// Redis-backed distributed store
///
/// Holds `pool_size` lazily established connection managers used round-robin.
/// A slot that fails to connect stays empty and is retried on next use.
pub struct RedisBackend {
    client: Client,
    endpoint: String,
    slots: Vec<OnceCell<ConnectionManager>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Resolve the primary and prepare the pool.
    ///
    /// Fails only on configuration problems (no endpoints, malformed URL). An
    /// unreachable backend is tolerated: connections are made on demand.
    pub async fn connect(
        endpoints: &[String],
        pool_size: usize,
        discovery: &dyn PrimaryDiscovery,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("no Redis endpoints configured".into()));
        }
        for endpoint in endpoints {
            Client::open(endpoint.as_str()).map_err(|e| {
                Error::Config(format!("invalid Redis endpoint '{}': {}", endpoint, e))
            })?;
        }

        let endpoint = match discovery.discover(endpoints).await {
            Ok(primary) => primary,
            Err(e) => {
                warn!(
                    error = %e,
                    fallback = %endpoints[0],
                    "Primary discovery failed, using first endpoint"
                );
                endpoints[0].clone()
            }
        };

        let client = Client::open(endpoint.as_str())
            .map_err(|e| Error::Config(format!("invalid Redis endpoint '{}': {}", endpoint, e)))?;
        let slots = (0..pool_size.max(1)).map(|_| OnceCell::new()).collect();

        info!(endpoint = %endpoint, pool_size = pool_size.max(1), "Redis backend configured");

        Ok(Self {
            client,
            endpoint,
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Endpoint the pool talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let conn = self.slots[idx]
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl DistributedBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let payload: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(payload)
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    #[instrument(skip(self), fields(glob = %matcher.to_glob()))]
    async fn scan_and_delete(&self, matcher: &KeyMatcher, batch_size: usize) -> Result<u64> {
        let mut conn = self.connection().await?;
        let glob = matcher.to_glob();
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(batch_size.max(1))
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
                debug!(batch = keys.len(), deleted, "Deleted scanned batch");
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
