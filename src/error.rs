//! Error types for the caching layer
//!
//! Callers of the engine observe exactly three outcomes: a value, an
//! explicit miss, or a source failure. Store outages, lock contention, and
//! corrupt payloads are handled internally and never cross the public
//! boundary.

use thiserror::Error;

/// Caching layer errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// The authoritative source failed during a load. Always propagated.
    #[error("source lookup failed: {0}")]
    Source(String),

    /// The shared store rejected or timed out an operation. Reads degrade
    /// to a miss and writes are best-effort, so this variant stays inside
    /// the engine.
    #[error("store error: {0}")]
    Store(String),

    /// A stored raw value decoded as neither a value nor the null
    /// sentinel. The entry is evicted and the probe counts as a miss.
    #[error("corrupt cache payload: {0}")]
    Corrupt(String),

    /// Invalid configuration detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for caching operations
pub type CacheResult<T> = Result<T, CacheError>;

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Corrupt(err.to_string())
    }
}
