//! Cache Router
//!
//! Owns the three tiers and the policy table. Reads go fastest tier first and
//! promote hits into the earlier tiers; writes and invalidations fan out to
//! every tier named by the policy (or an explicit override).
//!
//! # Lookup
//!
//! ```text
//! get_or_compute(key, data_type)
//!        │
//!        ▼
//!   ┌─────────┐ hit  ┌──────────────────────────┐
//!   │   L1    │─────►│ return                   │
//!   └────┬────┘      └──────────────────────────┘
//!        │ miss
//!        ▼
//!   ┌─────────┐ hit  ┌──────────────────────────┐
//!   │   L2    │─────►│ promote to L1, return    │
//!   └────┬────┘      └──────────────────────────┘
//!        │ miss
//!        ▼
//!   single-flight compute ──► set(key) on all tiers ──► publish to waiters
//! ```
//!
//! The edge tier has no read path and is skipped on lookups.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::codec;
use super::l1::{BoundedLocalCache, L1Stats};
use super::l2::{DistributedCache, L2Stats};
use super::l3::{EdgeCache, EdgeStats, PACKED_CONTENT_TYPE};
use super::metrics::{
    recommend, LookupOutcome, Recommendation, RecommendationThresholds, RouterMetrics,
    RouterSnapshot,
};
use super::policy::{CacheTier, KeyMatcher, PolicyTable};
use crate::error::{BoxError, Error, Result};

/// Published result of an in-flight computation (`None` until done)
type FlightReceiver = watch::Receiver<Option<Bytes>>;

enum Flight {
    Leader(watch::Sender<Option<Bytes>>),
    Follower(FlightReceiver),
}

/// Removes a key from the in-flight table when the leader finishes or is dropped
struct FlightGuard<'a> {
    table: &'a Mutex<HashMap<String, FlightReceiver>>,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(self.key);
    }
}

/// Multi-tier cache router
pub struct CacheStrategy {
    l1: Arc<BoundedLocalCache>,
    l2: Arc<DistributedCache>,
    l3: Arc<EdgeCache>,
    policies: PolicyTable,
    thresholds: RecommendationThresholds,
    metrics: RouterMetrics,
    /// Separate from the L1 lock; never held across an await
    in_flight: Mutex<HashMap<String, FlightReceiver>>,
}

impl CacheStrategy {
    /// Create a router over existing tiers
    pub fn new(
        l1: Arc<BoundedLocalCache>,
        l2: Arc<DistributedCache>,
        l3: Arc<EdgeCache>,
        policies: PolicyTable,
    ) -> Self {
        Self {
            l1,
            l2,
            l3,
            policies,
            thresholds: RecommendationThresholds::default(),
            metrics: RouterMetrics::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Override the recommendation thresholds
    pub fn with_thresholds(mut self, thresholds: RecommendationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look `key` up across its tiers without computing on a miss
    #[instrument(skip(self), level = "debug")]
    pub async fn get<V>(
        &self,
        key: &str,
        data_type: &str,
        tiers: Option<&[CacheTier]>,
    ) -> Option<V>
    where
        V: DeserializeOwned,
    {
        let start = Instant::now();
        let policy = self.policies.resolve(data_type);
        let tiers = tiers.unwrap_or(&policy.tiers[..]);

        let found = self.lookup::<V>(key, tiers, policy.ttl).await;
        let outcome = match &found {
            Some((_, tier)) => LookupOutcome::Hit(*tier),
            None => LookupOutcome::Miss,
        };
        self.metrics.record_lookup(outcome, start.elapsed());
        found.map(|(value, _)| value)
    }

    /// Look `key` up; on a total miss compute it once, cache it and return it.
    ///
    /// Concurrent misses for the same key share one computation. If that
    /// computation fails, each waiting caller runs `compute` itself.
    #[instrument(skip(self, compute), level = "debug")]
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
        let start = Instant::now();
        let policy = self.policies.resolve(data_type);
        let tiers = tiers.unwrap_or(&policy.tiers[..]);

        if let Some((value, tier)) = self.lookup::<V>(key, tiers, policy.ttl).await {
            self.metrics
                .record_lookup(LookupOutcome::Hit(tier), start.elapsed());
            return Ok(value);
        }

        let result = self
            .compute_single_flight(key, tiers, policy.ttl, compute)
            .await;
        self.metrics.record_lookup(LookupOutcome::Miss, start.elapsed());
        result
    }

    /// Walk `tiers` in order; unpack and promote the first hit
    async fn lookup<V>(&self, key: &str, tiers: &[CacheTier], ttl: Duration) -> Option<(V, CacheTier)>
    where
        V: DeserializeOwned,
    {
        for (idx, tier) in tiers.iter().enumerate() {
            let packed = match tier {
                CacheTier::L1 => self.l1.get(key),
                CacheTier::L2 => self.l2.get(key).await,
                CacheTier::L3 => continue,
            };
            let Some(packed) = packed else {
                continue;
            };

            match codec::unpack::<V>(&packed) {
                Ok(value) => {
                    self.promote(key, &packed, &tiers[..idx], ttl).await;
                    return Some((value, *tier));
                }
                Err(e) => {
                    warn!(key, tier = tier.label(), error = %e, "Dropping entry that does not unpack as requested type");
                    self.remove_from(key, *tier).await;
                }
            }
        }
        None
    }

    /// Copy a hit into every tier consulted before the one that served it
    async fn promote(&self, key: &str, packed: &Bytes, earlier: &[CacheTier], ttl: Duration) {
        for tier in earlier {
            match tier {
                CacheTier::L1 => {
                    if let Err(e) = self.l1.set(key, packed.clone(), ttl) {
                        debug!(key, error = %e, "Skipping L1 promotion");
                        continue;
                    }
                }
                CacheTier::L2 => self.l2.set(key, packed, Some(ttl)).await,
                CacheTier::L3 => {
                    self.l3
                        .push(key, packed.clone(), PACKED_CONTENT_TYPE, ttl)
                        .await
                }
            }
            self.metrics.record_promotion();
            debug!(key, to = tier.label(), "Promoted");
        }
    }

    async fn remove_from(&self, key: &str, tier: CacheTier) {
        match tier {
            CacheTier::L1 => {
                self.l1.remove(key);
            }
            CacheTier::L2 => {
                self.l2.delete(&[key.to_string()]).await;
            }
            CacheTier::L3 => {}
        }
    }

    async fn compute_single_flight<V, F, Fut, E>(
        &self,
        key: &str,
        tiers: &[CacheTier],
        ttl: Duration,
        compute: F,
    ) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<BoxError>,
    {
        let flight = {
            let mut table = self.in_flight.lock();
            match table.get(key) {
                Some(rx) => Flight::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    table.insert(key.to_string(), rx);
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Leader(tx) => {
                let _guard = FlightGuard {
                    table: &self.in_flight,
                    key,
                };
                let (value, packed) = self.compute_and_store(key, tiers, ttl, compute).await?;
                if let Some(packed) = packed {
                    tx.send_replace(Some(packed));
                }
                Ok(value)
            }
            Flight::Follower(mut rx) => {
                let shared = rx
                    .wait_for(|published| published.is_some())
                    .await
                    .ok()
                    .and_then(|published| published.clone());

                if let Some(packed) = shared {
                    match codec::unpack::<V>(&packed) {
                        Ok(value) => {
                            self.metrics.record_coalesced();
                            return Ok(value);
                        }
                        Err(e) => debug!(key, error = %e, "Shared value has another type"),
                    }
                }

                debug!(key, "Shared computation unavailable, computing locally");
                self.compute_and_store(key, tiers, ttl, compute)
                    .await
                    .map(|(value, _)| value)
            }
        }
    }

    /// Run `compute` and cache the result. Caching failures are logged; the
    /// computed value is returned regardless.
    async fn compute_and_store<V, F, Fut, E>(
        &self,
        key: &str,
        tiers: &[CacheTier],
        ttl: Duration,
        compute: F,
    ) -> Result<(V, Option<Bytes>)>
    where
        V: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<BoxError>,
    {
        let value = compute().await.map_err(Error::compute)?;

        let packed = match codec::pack(&value) {
            Ok(packed) => packed,
            Err(e) => {
                warn!(key, error = %e, "Computed value could not be packed, not caching");
                return Ok((value, None));
            }
        };

        if let Err(e) = self.store(key, packed.clone(), ttl, tiers).await {
            warn!(key, error = %e, "Computed value could not be cached");
        }
        Ok((value, Some(packed)))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` in every tier of its policy (or `tiers`)
    ///
    /// L1 is written first so the caller reads its own write. L2 and L3 are
    /// written concurrently and their failures are absorbed. An L1 capacity
    /// error is returned once the other tiers have been written.
    #[instrument(skip(self, value), level = "debug")]
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
        let packed = codec::pack(value)?;
        let policy = self.policies.resolve(data_type);
        let tiers = tiers.unwrap_or(&policy.tiers[..]);
        self.store(key, packed, policy.ttl, tiers).await
    }

    async fn store(&self, key: &str, packed: Bytes, ttl: Duration, tiers: &[CacheTier]) -> Result<()> {
        let l1_result = if tiers.contains(&CacheTier::L1) {
            self.l1.set(key, packed.clone(), ttl)
        } else {
            Ok(())
        };

        let l2 = async {
            if tiers.contains(&CacheTier::L2) {
                self.l2.set(key, &packed, Some(ttl)).await;
            }
        };
        let l3 = async {
            if tiers.contains(&CacheTier::L3) {
                self.l3
                    .push(key, packed.clone(), PACKED_CONTENT_TYPE, ttl)
                    .await;
            }
        };
        futures::join!(l2, l3);

        l1_result
    }

    /// Remove every key accepted by `matcher` from `tiers` (all tiers by default)
    #[instrument(skip(self, matcher), fields(matcher = %matcher))]
    pub async fn invalidate(
        &self,
        matcher: &KeyMatcher,
        tiers: Option<&[CacheTier]>,
    ) -> InvalidationReport {
        let tiers = tiers.unwrap_or(&CacheTier::ALL[..]);

        let l1_removed = if tiers.contains(&CacheTier::L1) {
            self.l1.invalidate(Some(matcher))
        } else {
            0
        };

        let l2 = async {
            if tiers.contains(&CacheTier::L2) {
                self.l2.invalidate_pattern(matcher).await
            } else {
                0
            }
        };
        let l3 = async {
            if tiers.contains(&CacheTier::L3) {
                self.l3.invalidate(matcher).await;
            }
        };
        let (l2_removed, ()) = futures::join!(l2, l3);

        let report = InvalidationReport {
            l1_removed,
            l2_removed,
        };
        info!(l1 = l1_removed, l2 = l2_removed, "Invalidated");
        report
    }

    /// Remove exact keys from L1 and L2
    ///
    /// The edge has no exact-key purge; use [`invalidate`](Self::invalidate)
    /// to purge it.
    pub async fn delete(&self, keys: &[String], tiers: Option<&[CacheTier]>) -> u64 {
        let tiers = tiers.unwrap_or(&CacheTier::ALL[..]);
        let mut removed = 0u64;

        if tiers.contains(&CacheTier::L1) {
            removed += keys.iter().filter(|key| self.l1.remove(key)).count() as u64;
        }
        if tiers.contains(&CacheTier::L2) {
            removed += self.l2.delete(keys).await;
        }
        removed
    }

    /// Ask the edge to pull `keys` ahead of traffic
    pub async fn warm_edge(&self, keys: &[String]) -> usize {
        self.l3.warm(keys).await
    }

    /// Drop expired L1 entries
    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of router counters, tier statistics and recommendations
    pub fn stats(&self) -> StrategyStats {
        let router = self.metrics.snapshot();
        let l1 = self.l1.stats();
        let recommendations = recommend(&router, &l1, &self.thresholds);

        StrategyStats {
            router,
            l1,
            l2: self.l2.stats(),
            l3: self.l3.stats(),
            recommendations,
            generated_at: Utc::now(),
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    pub fn l1(&self) -> &BoundedLocalCache {
        &self.l1
    }

    pub fn l2(&self) -> &DistributedCache {
        &self.l2
    }

    pub fn l3(&self) -> &EdgeCache {
        &self.l3
    }

    /// Number of keys currently being computed
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Entries removed by an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InvalidationReport {
    pub l1_removed: usize,
    pub l2_removed: u64,
}

/// Router statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    /// Per-call counters
    pub router: RouterSnapshot,
    pub l1: L1Stats,
    pub l2: L2Stats,
    pub l3: EdgeStats,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
