//! Error types for the fincache cache subsystem

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by a caller-supplied compute function
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the cache subsystem
///
/// Backend availability errors (`Connection`, `Timeout`, `Redis`, `Http`) are
/// absorbed at the tier boundary and never escape a cache operation. The
/// remaining variants indicate caller mistakes or configuration problems.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Backend Availability (absorbed by tiers)
    // =========================================================================
    /// Distributed or edge backend unreachable
    #[error("Backend connection error: {0}")]
    Connection(String),

    /// Backend call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Edge HTTP error
    #[error("Edge HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Caller Errors (raised)
    // =========================================================================
    /// Value could not be packed or unpacked
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A single value is larger than the whole L1 memory budget
    #[error("Value for key '{key}' is {size} bytes, exceeding the L1 budget of {max_bytes} bytes")]
    Capacity {
        key: String,
        size: u64,
        max_bytes: u64,
    },

    /// Caller-supplied compute function failed
    #[error("Compute function failed: {0}")]
    Compute(#[source] BoxError),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML settings parse error
    #[error("Failed to parse settings: {0}")]
    SettingsParse(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error means a backend was unavailable rather than
    /// that the caller did something wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Timeout { .. } | Error::Redis(_) | Error::Http(_)
        )
    }

    /// Wrap a compute-function error
    pub fn compute<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Compute(err.into())
    }
}
