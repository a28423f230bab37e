//! Pre-admission filtering
//!
//! Every read path evaluates an admission predicate before touching the
//! cache or the source. Symbols that fail admission are answered as a miss
//! with zero IO, which is what keeps penetration traffic off the source.

use std::fmt;
use std::sync::Arc;

use crate::bloom::BloomFilter;

/// Predicate deciding whether a symbol may reach the cache and source.
#[derive(Clone)]
pub enum SymbolAdmission {
    /// Admit every symbol.
    Always,

    /// Admit symbols the bloom filter might contain. A stale filter
    /// rejects keys added to the source after the snapshot it was built
    /// from; install a rebuilt filter to pick them up.
    Bloom(Arc<BloomFilter>),

    /// Admit symbols accepted by an arbitrary predicate, e.g. a source
    /// whitelist check.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl SymbolAdmission {
    /// Whitelist admission over a membership callback. The callback must
    /// be cheap and must not perform source IO.
    pub fn whitelist<F>(contains: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        SymbolAdmission::Predicate(Arc::new(contains))
    }

    /// Bloom-filter admission over a frozen filter.
    pub fn bloom(filter: Arc<BloomFilter>) -> Self {
        SymbolAdmission::Bloom(filter)
    }

    /// Evaluate the predicate for a symbol.
    pub fn admits(&self, symbol: &str) -> bool {
        match self {
            SymbolAdmission::Always => true,
            SymbolAdmission::Bloom(filter) => filter.might_contain(symbol),
            SymbolAdmission::Predicate(pred) => pred(symbol),
        }
    }
}

impl fmt::Debug for SymbolAdmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolAdmission::Always => f.write_str("SymbolAdmission::Always"),
            SymbolAdmission::Bloom(_) => f.write_str("SymbolAdmission::Bloom"),
            SymbolAdmission::Predicate(_) => f.write_str("SymbolAdmission::Predicate"),
        }
    }
}
