//! Cache Entry Types
//!
//! Value plus bookkeeping for entries held by the local tier.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Entry lifecycle state as observed at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Entry is readable
    Live,
    /// TTL has elapsed; removed on next access
    Expired,
}

/// Cache entry: packed value and metadata
///
/// `value` holds the packed binary representation of the caller's value, so
/// `size_bytes` is exactly what the memory budget is charged for.
#[derive(Clone)]
pub struct CacheEntry {
    key: String,
    value: Bytes,
    /// TTL (zero = never expires)
    ttl: Duration,
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
    size_bytes: u64,
}

impl CacheEntry {
    /// Create a new entry stamped with the current time
    pub fn new(key: impl Into<String>, value: Bytes, ttl: Duration) -> Self {
        let now = Instant::now();
        let size_bytes = value.len() as u64;
        Self {
            key: key.into(),
            value,
            ttl,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size_bytes,
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Packed value (cheap clone)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline]
    pub fn last_accessed_at(&self) -> Instant {
        self.last_accessed_at
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Record a read and return the new access count
    pub fn record_access(&mut self) -> u64 {
        self.last_accessed_at = Instant::now();
        self.access_count += 1;
        self.access_count
    }

    /// Check if the entry has expired at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    /// Check if the entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn state(&self) -> EntryState {
        if self.is_expired() {
            EntryState::Expired
        } else {
            EntryState::Live
        }
    }

    /// Time left before expiry (`None` for entries that never expire)
    pub fn remaining_ttl(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            return None;
        }
        Some(self.ttl.saturating_sub(self.created_at.elapsed()))
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size_bytes", &self.size_bytes)
            .field("access_count", &self.access_count)
            .field("ttl", &self.ttl)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
