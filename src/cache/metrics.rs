//! Router Metrics
//!
//! Per-call counters for the cache router and the tuning recommendations
//! derived from them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::l1::L1Stats;
use super::policy::CacheTier;

/// Final outcome of one logical lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Served by a tier
    Hit(CacheTier),
    /// No tier had the key (computed or absent)
    Miss,
}

/// Router metrics collector
#[derive(Debug, Default)]
pub struct RouterMetrics {
    request_count: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    miss_count: AtomicU64,

    // Misses served by another caller's computation
    coalesced: AtomicU64,
    promotions: AtomicU64,

    // Lookup latency (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one logical lookup. Called exactly once per call.
    pub fn record_lookup(&self, outcome: LookupOutcome, latency: Duration) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            LookupOutcome::Hit(CacheTier::L1) => &self.l1_hits,
            LookupOutcome::Hit(CacheTier::L2) => &self.l2_hits,
            LookupOutcome::Hit(CacheTier::L3) => &self.l3_hits,
            LookupOutcome::Miss => &self.miss_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(latency);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.get_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .get_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn hits(&self, tier: CacheTier) -> u64 {
        match tier {
            CacheTier::L1 => self.l1_hits.load(Ordering::Relaxed),
            CacheTier::L2 => self.l2_hits.load(Ordering::Relaxed),
            CacheTier::L3 => self.l3_hits.load(Ordering::Relaxed),
        }
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served by any tier
    pub fn hit_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            return 0.0;
        }
        let hits: u64 = CacheTier::ALL.iter().map(|t| self.hits(*t)).sum();
        hits as f64 / requests as f64
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            request_count: self.request_count(),
            l1_hits: self.hits(CacheTier::L1),
            l2_hits: self.hits(CacheTier::L2),
            l3_hits: self.hits(CacheTier::L3),
            miss_count: self.miss_count(),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            avg_get_latency_us: self.get_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.request_count.store(0, Ordering::Relaxed);
        self.l1_hits.store(0, Ordering::Relaxed);
        self.l2_hits.store(0, Ordering::Relaxed);
        self.l3_hits.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
        self.coalesced.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.get_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of router counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterSnapshot {
    pub request_count: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub miss_count: u64,
    pub coalesced: u64,
    /// Values copied into a faster tier after a hit
    pub promotions: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    pub avg_get_latency_us: u64,
}

// =============================================================================
// Recommendations
// =============================================================================

/// Tuning advice derived from counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    /// Overall hit rate is low; TTLs are probably too short
    IncreaseTtl { hit_rate: f64, request_count: u64 },
    /// L1 is evicting heavily; its memory budget is too small
    IncreaseL1Memory { evictions: u64, max_bytes: u64 },
    /// Most hits come from L2; hot data types should also live in L1
    PromoteHotDataToL1 { l1_hits: u64, l2_hits: u64 },
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::IncreaseTtl {
                hit_rate,
                request_count,
            } => write!(
                f,
                "hit rate {:.1}% over {} requests: consider increasing TTLs",
                hit_rate * 100.0,
                request_count
            ),
            Recommendation::IncreaseL1Memory {
                evictions,
                max_bytes,
            } => write!(
                f,
                "{} L1 evictions with a {} byte budget: consider increasing L1 memory",
                evictions, max_bytes
            ),
            Recommendation::PromoteHotDataToL1 { l1_hits, l2_hits } => write!(
                f,
                "L2 served {} hits vs {} from L1: consider promoting hot data to L1",
                l2_hits, l1_hits
            ),
        }
    }
}

/// Thresholds used to derive recommendations
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationThresholds {
    /// Requests required before judging the hit rate
    pub min_requests: u64,
    /// Hit rate below which TTLs should grow
    pub min_hit_rate: f64,
    /// L1 evictions above which the budget should grow
    pub max_l1_evictions: u64,
    /// L2/L1 hit ratio above which hot data should move to L1
    pub l2_over_l1_ratio: f64,
    /// L2 hits required before judging the ratio
    pub min_l2_hits: u64,
}

impl Default for RecommendationThresholds {
    fn default() -> Self {
        Self {
            min_requests: 1000,
            min_hit_rate: 0.7,
            max_l1_evictions: 1000,
            l2_over_l1_ratio: 2.0,
            min_l2_hits: 100,
        }
    }
}

/// Derive recommendations from router counters and L1 statistics
pub fn recommend(
    router: &RouterSnapshot,
    l1: &L1Stats,
    thresholds: &RecommendationThresholds,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    if router.request_count >= thresholds.min_requests && router.hit_rate < thresholds.min_hit_rate
    {
        recommendations.push(Recommendation::IncreaseTtl {
            hit_rate: router.hit_rate,
            request_count: router.request_count,
        });
    }

    if l1.evictions > thresholds.max_l1_evictions {
        recommendations.push(Recommendation::IncreaseL1Memory {
            evictions: l1.evictions,
            max_bytes: l1.max_bytes,
        });
    }

    if router.l2_hits >= thresholds.min_l2_hits
        && router.l2_hits as f64 > router.l1_hits as f64 * thresholds.l2_over_l1_ratio
    {
        recommendations.push(Recommendation::PromoteHotDataToL1 {
            l1_hits: router.l1_hits,
            l2_hits: router.l2_hits,
        });
    }

    recommendations
}

// =============================================================================
// Tests
// =============================================================================
