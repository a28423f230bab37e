//! Cache engine configuration
//!
//! An immutable bundle of tunables shared by every read and write path.
//! Construct once, validate, and hand to the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Tunables for the caching engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Base physical TTL for positive entries (seconds)
    pub base_ttl_secs: u64,

    /// Inclusive upper bound of the TTL jitter offset (seconds)
    pub ttl_jitter_secs: u64,

    /// Distributed lock lease; the lock-wait backoff derives from this
    /// (milliseconds)
    pub lock_timeout_ms: u64,

    /// TTL for negative (null sentinel) entries (seconds)
    pub null_cache_ttl_secs: u64,

    /// Time until a logical-expire entry becomes stale (seconds)
    pub logical_expire_secs: u64,

    /// Extra physical TTL on logical-expire entries, guaranteeing a stale
    /// envelope stays observable for the full refresh window (seconds)
    pub stale_ttl_buffer_secs: u64,

    /// Background refresh worker pool size
    pub refresh_threads: usize,

    /// In-process single-flight join timeout (milliseconds)
    pub single_flight_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_ttl_secs: 60,
            ttl_jitter_secs: 10,
            lock_timeout_ms: 100,
            null_cache_ttl_secs: 30,
            logical_expire_secs: 60,
            stale_ttl_buffer_secs: 30,
            refresh_threads: 4,
            single_flight_wait_ms: 500,
        }
    }
}

impl CacheConfig {
    /// Check the configuration for values the engine cannot operate with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.base_ttl_secs == 0 {
            return Err(CacheError::Config("base_ttl_secs must be >= 1".to_string()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CacheError::Config("lock_timeout_ms must be >= 1".to_string()));
        }
        if self.logical_expire_secs == 0 {
            return Err(CacheError::Config(
                "logical_expire_secs must be >= 1".to_string(),
            ));
        }
        if self.null_cache_ttl_secs == 0 {
            return Err(CacheError::Config(
                "null_cache_ttl_secs must be >= 1".to_string(),
            ));
        }
        if self.refresh_threads == 0 {
            return Err(CacheError::Config(
                "refresh_threads must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock lease duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Backoff slept by a caller that lost the lock race before it
    /// reprobes the cache.
    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms / 2)
    }

    /// Bounded wait for a sibling's in-flight load.
    pub fn single_flight_wait(&self) -> Duration {
        Duration::from_millis(self.single_flight_wait_ms)
    }

    /// Physical TTL applied to logical-expire entries.
    pub fn logical_physical_ttl(&self) -> Duration {
        Duration::from_secs(self.logical_expire_secs + self.stale_ttl_buffer_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.base_ttl_secs, 60);
        assert_eq!(config.ttl_jitter_secs, 10);
        assert_eq!(config.lock_timeout_ms, 100);
        assert_eq!(config.null_cache_ttl_secs, 30);
        assert_eq!(config.logical_expire_secs, 60);
        assert_eq!(config.stale_ttl_buffer_secs, 30);
        assert_eq!(config.refresh_threads, 4);
        assert_eq!(config.single_flight_wait_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = CacheConfig {
            refresh_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ttls() {
        for field in ["base", "lock", "logical", "null"] {
            let mut config = CacheConfig::default();
            match field {
                "base" => config.base_ttl_secs = 0,
                "lock" => config.lock_timeout_ms = 0,
                "logical" => config.logical_expire_secs = 0,
                _ => config.null_cache_ttl_secs = 0,
            }
            assert!(config.validate().is_err(), "{field} should be rejected");
        }
    }

    #[test]
    fn test_derived_durations() {
        let config = CacheConfig::default();
        assert_eq!(config.lock_backoff(), Duration::from_millis(50));
        assert_eq!(config.logical_physical_ttl(), Duration::from_secs(90));
    }
}
