//! Cache engine
//!
//! Orchestrates the read strategies over the shared store:
//! - plain cache-aside (miss path protected by the distributed lock)
//! - distributed-lock reads
//! - in-process single-flight reads
//! - logical-expire / stale-while-revalidate reads
//! - bloom- or predicate-gated reads
//!
//! plus the write and admin surface (put variants with TTL policy, force
//! refresh, evict). Every read path shares the same pre-admission filter
//! and the same post-load population rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::admission::SymbolAdmission;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::envelope::CacheEnvelope;
use crate::error::CacheResult;
use crate::lock::{LockLease, LockManager};
use crate::refresh::RefreshExecutor;
use crate::singleflight::SingleFlight;
use crate::source::SourceRepository;
use crate::store::StoreClient;

/// Reserved raw value recording a confirmed source miss. Serialized
/// payloads are JSON and therefore never equal this bare string.
pub const NULL_SENTINEL: &str = "__NULL__";

const KEY_PREFIX: &str = "quotes:";
const LOGICAL_KEY_PREFIX: &str = "quotes:logical:";
const LOCK_PREFIX: &str = "lock:";

fn cache_key(symbol: &str) -> String {
    format!("{KEY_PREFIX}{symbol}")
}

fn logical_cache_key(symbol: &str) -> String {
    format!("{LOGICAL_KEY_PREFIX}{symbol}")
}

fn lock_key(cache_key: &str) -> String {
    format!("{LOCK_PREFIX}{cache_key}")
}

/// Deterministic 32-bit string mix used for keyed TTL jitter. Matches the
/// JVM string hash (`h = h*31 + byte` over UTF-8 bytes with i32
/// wrap-around), so a key maps to the same offset on every run.
fn stable_hash(s: &str) -> i32 {
    s.bytes()
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32))
}

/// Outcome of a plain-entry cache probe.
enum Probe<V> {
    /// A decoded domain value.
    Hit(V),
    /// The null sentinel: the source is known to have nothing here.
    NegativeHit,
    /// Nothing usable; also covers store outages and corrupt payloads.
    Absent,
}

#[derive(Debug, Default)]
struct EngineCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    source_loads: AtomicU64,
    refresh_dispatches: AtomicU64,
    refresh_drops: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from the cache, negative entries included.
    pub hits: u64,
    /// Reads that had to go past the cache.
    pub misses: u64,
    /// Synchronous loads issued against the source.
    pub source_loads: u64,
    /// Stale-while-revalidate refreshes handed to the background pool.
    pub refresh_dispatches: u64,
    /// Refreshes dropped because the pool was saturated.
    pub refresh_drops: u64,
}

/// Read-through caching facade over a shared store and an authoritative
/// source.
///
/// Construct with [`QuoteCache::new`] for wall-clock time and open
/// admission, or [`QuoteCache::with_parts`] to inject a clock and an
/// admission policy.
pub struct QuoteCache<V> {
    store: Arc<dyn StoreClient>,
    source: Arc<dyn SourceRepository<V>>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    admission: RwLock<SymbolAdmission>,
    locks: LockManager,
    flights: SingleFlight<V>,
    refresher: RefreshExecutor,
    counters: Arc<EngineCounters>,
}

impl<V> QuoteCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create an engine with the system clock and open admission.
    pub fn new(
        store: Arc<dyn StoreClient>,
        source: Arc<dyn SourceRepository<V>>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        Self::with_parts(
            store,
            source,
            Arc::new(SystemClock),
            config,
            SymbolAdmission::Always,
        )
    }

    /// Create an engine from explicit capabilities.
    pub fn with_parts(
        store: Arc<dyn StoreClient>,
        source: Arc<dyn SourceRepository<V>>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
        admission: SymbolAdmission,
    ) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            locks: LockManager::new(store.clone()),
            flights: SingleFlight::new(config.single_flight_wait()),
            refresher: RefreshExecutor::new(config.refresh_threads),
            store,
            source,
            clock,
            config,
            admission: RwLock::new(admission),
            counters: Arc::new(EngineCounters::default()),
        })
    }

    /// Replace the admission policy, e.g. to install a rebuilt bloom
    /// filter over a fresh key snapshot.
    pub fn set_admission(&self, admission: SymbolAdmission) {
        *self.admission.write() = admission;
    }

    /// Admission over the source's fast membership check.
    pub fn whitelist_admission(&self) -> SymbolAdmission {
        let source = self.source.clone();
        SymbolAdmission::whitelist(move |symbol| source.exists_symbol(symbol))
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            source_loads: self.counters.source_loads.load(Ordering::Relaxed),
            refresh_dispatches: self.counters.refresh_dispatches.load(Ordering::Relaxed),
            refresh_drops: self.counters.refresh_drops.load(Ordering::Relaxed),
        }
    }

    /// Remaining physical TTL of a symbol's plain entry in whole seconds
    /// (`-1` no expiry, `-2` absent). Diagnostic surface.
    pub async fn ttl_secs(&self, symbol: &str) -> CacheResult<i64> {
        self.store.ttl_secs(&cache_key(symbol)).await
    }

    /// Drain the background refresh pool and tear the engine down.
    pub async fn shutdown(self) {
        self.refresher.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    /// Cache-aside read. The miss path is coordinated through the
    /// distributed lock.
    pub async fn get(&self, symbol: &str) -> CacheResult<Option<V>> {
        if !self.admitted(symbol) {
            return Ok(None);
        }
        self.read_through_lock(symbol).await
    }

    /// Distributed-lock read; behaviorally identical to [`get`], named
    /// for callers that want the coordination choice explicit.
    ///
    /// [`get`]: QuoteCache::get
    pub async fn get_with_lock(&self, symbol: &str) -> CacheResult<Option<V>> {
        if !self.admitted(symbol) {
            return Ok(None);
        }
        self.read_through_lock(symbol).await
    }

    /// Read with in-process deduplication of concurrent misses.
    pub async fn get_with_single_flight(&self, symbol: &str) -> CacheResult<Option<V>> {
        if !self.admitted(symbol) {
            return Ok(None);
        }
        let key = cache_key(symbol);
        match self.probe(&key).await {
            Probe::Hit(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Probe::NegativeHit => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Probe::Absent => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.flights
                    .run(&key, || self.load_and_populate(symbol, &key))
                    .await
            }
        }
    }

    /// Stale-while-revalidate read over the logical-expiry entry.
    ///
    /// An absent entry is loaded synchronously. A present entry is served
    /// immediately; if its logical deadline has passed, a background
    /// refresh is dispatched under the logical lock and the stale payload
    /// is returned as-is.
    pub async fn get_with_logical_expire(&self, symbol: &str) -> CacheResult<Option<V>> {
        if !self.admitted(symbol) {
            return Ok(None);
        }
        let key = logical_cache_key(symbol);

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, %err, "store probe failed, loading from source");
                None
            }
        };

        let envelope = match raw {
            Some(raw) => match CacheEnvelope::<V>::from_wire(&raw) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(key, %err, "evicting corrupt envelope");
                    if let Err(err) = self.store.delete(&key).await {
                        debug!(key, %err, "eviction of corrupt envelope failed");
                    }
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return self.load_logical(symbol, &key).await;
                }
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return self.load_logical(symbol, &key).await;
            }
        };

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        if envelope.is_expired(self.clock.now_millis()) {
            self.dispatch_refresh(symbol, &key).await;
        }
        Ok(envelope.value)
    }

    /// Cache-aside read gated by a caller-supplied predicate (typically a
    /// bloom filter probe) instead of the engine's admission policy.
    pub async fn get_with_symbol_filter<F>(
        &self,
        symbol: &str,
        predicate: F,
    ) -> CacheResult<Option<V>>
    where
        F: Fn(&str) -> bool,
    {
        if !predicate(symbol) {
            return Ok(None);
        }
        self.read_through_lock(symbol).await
    }

    // ------------------------------------------------------------------
    // Writes and admin
    // ------------------------------------------------------------------

    /// Store a value under its plain key with an exact TTL, no jitter.
    pub async fn put_with_fixed_ttl(&self, symbol: &str, value: &V, ttl: Duration) {
        if let Some(raw) = self.encode(symbol, value) {
            self.best_effort_set(&cache_key(symbol), &raw, Some(ttl)).await;
        }
    }

    /// Store a value with `base_ttl_secs` plus a uniformly random offset
    /// in `0..=ttl_jitter_secs`, decorrelating expiry of keys written
    /// together.
    pub async fn put_with_random_jitter(&self, symbol: &str, value: &V) {
        let ttl = self.jittered_ttl();
        self.put_with_fixed_ttl(symbol, value, ttl).await;
    }

    /// Store a value with `base_ttl_secs` plus a keyed offset derived
    /// from a stable hash of the cache key. The offset is identical on
    /// every run, which makes expiry timing reproducible per key.
    pub async fn put_with_hash_jitter(&self, symbol: &str, value: &V) {
        let key = cache_key(symbol);
        let span = self.config.ttl_jitter_secs + 1;
        let offset = u64::from(stable_hash(&key).unsigned_abs()) % span;
        let ttl = Duration::from_secs(self.config.base_ttl_secs + offset);
        if let Some(raw) = self.encode(symbol, value) {
            self.best_effort_set(&key, &raw, Some(ttl)).await;
        }
    }

    /// Store a value with no expiry; for deployments that refresh by
    /// push instead of TTL.
    pub async fn put_without_ttl(&self, symbol: &str, value: &V) {
        if let Some(raw) = self.encode(symbol, value) {
            self.best_effort_set(&cache_key(symbol), &raw, None).await;
        }
    }

    /// Write a logical-expiry envelope, `None` recording a confirmed
    /// source miss. Physical TTL exceeds the logical deadline by the
    /// configured stale buffer.
    pub async fn put_logical(&self, symbol: &str, value: Option<V>) {
        let key = logical_cache_key(symbol);
        self.write_envelope(&key, value).await;
    }

    /// Overwrite the plain entry with a fresh value and jittered TTL.
    pub async fn force_refresh(&self, symbol: &str, value: &V) {
        self.put_with_random_jitter(symbol, value).await;
    }

    /// Drop both the plain and the logical entries for a symbol.
    pub async fn evict(&self, symbol: &str) {
        for key in [cache_key(symbol), logical_cache_key(symbol)] {
            if let Err(err) = self.store.delete(&key).await {
                warn!(key = %key, %err, "eviction failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn admitted(&self, symbol: &str) -> bool {
        self.admission.read().admits(symbol)
    }

    async fn read_through_lock(&self, symbol: &str) -> CacheResult<Option<V>> {
        let key = cache_key(symbol);
        match self.probe(&key).await {
            Probe::Hit(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Probe::NegativeHit => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Probe::Absent => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.load_with_lock(symbol, &key).await
            }
        }
    }

    /// Probe the plain entry. Store outages and corrupt payloads both
    /// resolve to `Absent`; corruption additionally evicts the entry.
    async fn probe(&self, key: &str) -> Probe<V> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Probe::Absent,
            Err(err) => {
                warn!(key, %err, "store probe failed, treating as miss");
                return Probe::Absent;
            }
        };
        if raw == NULL_SENTINEL {
            return Probe::NegativeHit;
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Probe::Hit(value),
            Err(err) => {
                warn!(key, %err, "evicting corrupt entry");
                if let Err(err) = self.store.delete(key).await {
                    debug!(key, %err, "eviction of corrupt entry failed");
                }
                Probe::Absent
            }
        }
    }

    /// Miss path shared by the lock-coordinated reads: take the per-key
    /// lock, load, populate, release. Losers back off, reprobe, and make
    /// one direct source read if the holder left nothing behind.
    async fn load_with_lock(&self, symbol: &str, key: &str) -> CacheResult<Option<V>> {
        let lock_key = lock_key(key);
        match self
            .locks
            .try_acquire(&lock_key, self.config.lock_timeout())
            .await
        {
            Some(lease) => {
                let outcome = self.load_and_populate(symbol, key).await;
                self.locks.release(lease).await;
                outcome
            }
            None => {
                tokio::time::sleep(self.config.lock_backoff()).await;
                match self.probe(key).await {
                    Probe::Hit(value) => Ok(Some(value)),
                    Probe::NegativeHit => Ok(None),
                    // Holder crashed or is still in flight; one direct
                    // read bounds our tail latency.
                    Probe::Absent => self.load_and_populate(symbol, key).await,
                }
            }
        }
    }

    /// Load from the source and populate the plain entry: jittered TTL
    /// for a value, short-lived null sentinel for a confirmed miss. A
    /// source failure propagates and writes nothing.
    async fn load_and_populate(&self, symbol: &str, key: &str) -> CacheResult<Option<V>> {
        let loaded = self.source.find_by_symbol(symbol).await?;
        self.counters.source_loads.fetch_add(1, Ordering::Relaxed);
        match &loaded {
            Some(value) => {
                if let Some(raw) = self.encode(symbol, value) {
                    self.best_effort_set(key, &raw, Some(self.jittered_ttl()))
                        .await;
                }
            }
            None => {
                let ttl = Duration::from_secs(self.config.null_cache_ttl_secs);
                self.best_effort_set(key, NULL_SENTINEL, Some(ttl)).await;
            }
        }
        Ok(loaded)
    }

    /// Synchronous load for an absent logical entry.
    async fn load_logical(&self, symbol: &str, key: &str) -> CacheResult<Option<V>> {
        let loaded = self.source.find_by_symbol(symbol).await?;
        self.counters.source_loads.fetch_add(1, Ordering::Relaxed);
        self.write_envelope(key, loaded.clone()).await;
        Ok(loaded)
    }

    async fn write_envelope(&self, key: &str, value: Option<V>) {
        let deadline = self.clock.now_millis() + self.config.logical_expire_secs as i64 * 1_000;
        let envelope = CacheEnvelope::new(value, deadline);
        match envelope.to_wire() {
            Ok(raw) => {
                self.best_effort_set(key, &raw, Some(self.config.logical_physical_ttl()))
                    .await;
            }
            Err(err) => warn!(key, %err, "skipping write of unencodable envelope"),
        }
    }

    /// Try to win the logical lock and hand the refresh to the pool.
    /// Only the winner reloads; if the pool is saturated the lock is
    /// released at once so the next stale reader can retry.
    async fn dispatch_refresh(&self, symbol: &str, key: &str) {
        let lock_key = lock_key(key);
        let Some(lease) = self
            .locks
            .try_acquire(&lock_key, self.config.lock_timeout())
            .await
        else {
            return;
        };

        let task = self.refresh_task(symbol, key, lease.clone());
        if self.refresher.try_submit(task) {
            self.counters.refresh_dispatches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.refresh_drops.fetch_add(1, Ordering::Relaxed);
            self.locks.release(lease).await;
        }
    }

    fn refresh_task(
        &self,
        symbol: &str,
        key: &str,
        lease: LockLease,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let source = self.source.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let locks = self.locks.clone();
        let counters = self.counters.clone();
        let logical_expire_ms = self.config.logical_expire_secs as i64 * 1_000;
        let physical_ttl = self.config.logical_physical_ttl();
        let symbol = symbol.to_string();
        let key = key.to_string();

        async move {
            match source.find_by_symbol(&symbol).await {
                Ok(value) => {
                    counters.source_loads.fetch_add(1, Ordering::Relaxed);
                    let envelope =
                        CacheEnvelope::new(value, clock.now_millis() + logical_expire_ms);
                    match envelope.to_wire() {
                        Ok(raw) => {
                            if let Err(err) = store.set_with_ttl(&key, &raw, physical_ttl).await {
                                warn!(key = %key, %err, "refresh write failed");
                            }
                        }
                        Err(err) => warn!(key = %key, %err, "refresh produced unencodable envelope"),
                    }
                }
                // The stale entry stays serveable; nothing to roll back.
                Err(err) => warn!(symbol = %symbol, %err, "background refresh load failed"),
            }
            locks.release(lease).await;
        }
    }

    fn jittered_ttl(&self) -> Duration {
        let offset = rand::thread_rng().gen_range(0..=self.config.ttl_jitter_secs);
        Duration::from_secs(self.config.base_ttl_secs + offset)
    }

    fn encode(&self, symbol: &str, value: &V) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!(symbol, %err, "skipping write of unencodable value");
                None
            }
        }
    }

    async fn best_effort_set(&self, key: &str, raw: &str, ttl: Option<Duration>) {
        let result = match ttl {
            Some(ttl) => self.store.set_with_ttl(key, raw, ttl).await,
            None => self.store.set(key, raw).await,
        };
        if let Err(err) = result {
            warn!(key, %err, "cache population failed");
        }
    }
}
