//! # quotecache - Pathology-Resistant Read-Through Caching
//!
//! A caching facade that sits between request handlers and an
//! authoritative data source, using a shared Redis-compatible store as
//! the cache tier. It is built to survive the three classic failure
//! patterns of that topology:
//!
//! - **Stampede**: concurrent misses for one key are coordinated through
//!   a store-side distributed lock or coalesced in-process by
//!   single-flight, so a traffic burst costs a bounded number of source
//!   loads.
//! - **Avalanche**: TTLs are decorrelated with random or keyed jitter so
//!   a population of keys written together does not expire together.
//! - **Penetration**: admission filtering (whitelist or bloom filter)
//!   and short-lived negative entries keep lookups for nonexistent keys
//!   off the source.
//!
//! ## Architecture
//!
//! - `config`: immutable bundle of tunables (TTLs, jitter, timeouts, pool size)
//! - `clock`: "now in milliseconds" capability, swappable in tests
//! - `store`: typed surface over the shared store (Redis or in-memory)
//! - `envelope`: logical-expiry wrapper for stale-while-revalidate entries
//! - `bloom`: build-once-read-many bloom filter
//! - `admission`: pre-admission predicate (always / bloom / whitelist)
//! - `singleflight`: in-process deduplication of concurrent loads
//! - `lock`: token-guarded distributed lock leases
//! - `refresh`: bounded background pool for SWR refreshes
//! - `source`: contract the authoritative data source satisfies
//! - `engine`: the orchestrator tying the strategies together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quotecache::{CacheConfig, QuoteCache, RedisStore, SourceRepository};
//!
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct Quote { price: f64 }
//! # async fn example(source: Arc<dyn SourceRepository<Quote>>) -> quotecache::CacheResult<()> {
//! let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//! let cache = QuoteCache::new(store, source, CacheConfig::default())?;
//!
//! // Cache-aside read; the miss path is lock-coordinated.
//! let _quote = cache.get("BTC").await?;
//!
//! // Stale-while-revalidate read; stale hits return immediately and
//! // refresh in the background.
//! let _quote = cache.get_with_logical_expire("BTC").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration and capabilities
pub mod clock;
pub mod config;
pub mod error;

// Shared store surface
pub mod store;

// Strategy building blocks
pub mod admission;
pub mod bloom;
pub mod envelope;
pub mod lock;
pub mod refresh;
pub mod singleflight;

// Source contract and orchestrator
pub mod engine;
pub mod source;

// Re-export commonly used types
pub use admission::SymbolAdmission;
pub use bloom::BloomFilter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use engine::{CacheStats, QuoteCache, NULL_SENTINEL};
pub use envelope::CacheEnvelope;
pub use error::{CacheError, CacheResult};
pub use lock::{LockLease, LockManager};
pub use refresh::RefreshExecutor;
pub use singleflight::SingleFlight;
pub use source::SourceRepository;
pub use store::{MemoryStore, RedisStore, StoreClient};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
