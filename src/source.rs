//! Authoritative data source contract
//!
//! The engine addresses its backing database or remote API exclusively
//! through this trait. Lookup failures propagate to the caller untouched;
//! the engine never masks a broken source as a miss.

use async_trait::async_trait;

use crate::error::CacheResult;

/// Read-side contract the authoritative source must satisfy.
#[async_trait]
pub trait SourceRepository<V>: Send + Sync {
    /// Load the record for a symbol. May block and may fail; a failure is
    /// surfaced to the caller as-is and no negative cache entry is
    /// written.
    async fn find_by_symbol(&self, symbol: &str) -> CacheResult<Option<V>>;

    /// Fast membership check used for whitelist admission. Must not
    /// perform source IO.
    fn exists_symbol(&self, symbol: &str) -> bool;
}
