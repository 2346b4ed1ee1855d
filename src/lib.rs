//! fincache - Multi-Tier Cache for Financial Planning Services
//!
//! Cache-aside caching with per-data-type placement across an in-process LRU
//! (L1), a Redis-backed distributed tier (L2) and an optional edge network
//! (L3).
//!
//! # Architecture
//!
//! ```text
//! caller ──► CacheManager ──► CacheStrategy ──► L1 ─► L2 ─► compute
//!                                   │
//!                                   └──► set / invalidate fan-out ──► L1, L2, L3
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fincache::{CacheConfig, CacheManager};
//!
//! # async fn run() -> fincache::Result<()> {
//! let cache = CacheManager::init(CacheConfig::default()).await?;
//!
//! let price: f64 = cache
//!     .get_or_compute("quote:AAPL", "quote", None, || async {
//!         Ok::<_, fincache::Error>(187.42)
//!     })
//!     .await?;
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, router, policies and manager
//! - [`config`] - YAML settings
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheConfig, CacheManager, CacheStrategy, CacheTier, KeyMatcher, MatchMode, PolicyTable,
    StrategyStats, TierPolicy,
};
pub use config::CacheSettings;
pub use error::{Error, Result};
