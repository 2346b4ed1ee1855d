//! Multi-Tier Cache
//!
//! Cache-aside caching for the planning backend with an in-process L1, a
//! Redis-backed L2 and a best-effort edge L3.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Manager                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                    CacheStrategy (policy router)                         │
//! │        data type ──► {ttl, tiers}   promotion   single-flight            │
//! ├────────────────────────┬────────────────────────┬────────────────────────┤
//! │  L1 (Local)            │  L2 (Distributed)      │  L3 (Edge)             │
//! │  ┌──────────────────┐  │  ┌──────────────────┐  │  ┌──────────────────┐  │
//! │  │ LRU              │  │  │ Redis pool       │  │  │ HTTP fan-out     │  │
//! │  │ entries + bytes  │  │  │ LZ4 > threshold  │  │  │ push/purge/warm  │  │
//! │  │ bounded          │  │  │ 250ms deadline   │  │  │ 500ms deadline   │  │
//! │  └──────────────────┘  │  └──────────────────┘  │  └──────────────────┘  │
//! └────────────────────────┴────────────────────────┴────────────────────────┘
//! ```
//!
//! # Failure Model
//!
//! - L1 never fails except when a single value exceeds its whole budget
//! - L2 and L3 failures are logged and absorbed; the router degrades to
//!   the remaining tiers and the caller's compute function
//! - A miss is `None`, never an error

mod backend;
mod codec;
mod entry;
mod l1;
mod l2;
mod l3;
mod manager;
mod metrics;
mod policy;
mod redis_backend;
mod strategy;
mod wrap;
pub mod compression;

pub use backend::{DistributedBackend, InMemoryBackend};
pub use codec::{pack, unpack};
pub use compression::{Compressor, Lz4Compressor, PayloadCodec};
pub use entry::{CacheEntry, EntryState};
pub use l1::{BoundedLocalCache, L1Config, L1Stats};
pub use l2::{DistributedCache, L2Config, L2Stats};
pub use l3::{
    EdgeBackend, EdgeCache, EdgeStats, HttpEdgeBackend, InMemoryEdgeBackend, L3Config,
    PACKED_CONTENT_TYPE,
};
pub use manager::{CacheConfig, CacheManager};
pub use metrics::{
    LookupOutcome, Recommendation, RecommendationThresholds, RouterMetrics, RouterSnapshot,
};
pub use policy::{CacheTier, DataClass, KeyMatcher, MatchMode, PolicyTable, TierPolicy};
pub use redis_backend::{
    DiscoveryMode, FirstEndpoint, PrimaryDiscovery, RedisBackend, ReplicationRoleDiscovery,
};
pub use strategy::{CacheStrategy, InvalidationReport, StrategyStats};
pub use wrap::{build_key, Memoized};

/// Default L1 entry limit
pub const DEFAULT_L1_MAX_ENTRIES: usize = 10_000;

/// Default L1 memory budget (100MB)
pub const DEFAULT_L1_MAX_BYTES: u64 = 100 * 1024 * 1024;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let config = L1Config::default();
        assert_eq!(config.max_entries, DEFAULT_L1_MAX_ENTRIES);
        assert_eq!(config.max_bytes, DEFAULT_L1_MAX_BYTES);
    }

    #[test]
    fn test_default_l2_settings() {
        let config = L2Config::default();
        assert_eq!(config.compression_threshold, 1024);
        assert_eq!(config.op_timeout, std::time::Duration::from_millis(250));
    }
}
