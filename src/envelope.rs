//! Logical-expiry envelope
//!
//! Stale-while-revalidate entries wrap the payload together with an
//! application-managed freshness deadline. The store's physical TTL
//! outlives the deadline by a configured buffer, so a stale-but-present
//! envelope stays observable for the whole refresh window.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// Payload plus its logical freshness deadline.
///
/// A `None` value records a negative entry: the source was consulted and
/// had nothing for this key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<V> {
    /// The cached payload, or `None` for a confirmed source miss.
    pub value: Option<V>,

    /// Milliseconds since the UNIX epoch after which the entry is stale.
    pub logical_expire_at_ms: i64,
}

impl<V> CacheEnvelope<V> {
    /// Wrap a payload with a freshness deadline.
    pub fn new(value: Option<V>, logical_expire_at_ms: i64) -> Self {
        Self {
            value,
            logical_expire_at_ms,
        }
    }

    /// Whether the entry has passed its logical deadline.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.logical_expire_at_ms
    }
}

impl<V: Serialize> CacheEnvelope<V> {
    /// Encode to the textual wire format stored under `quotes:logical:*`.
    pub fn to_wire(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<V: DeserializeOwned> CacheEnvelope<V> {
    /// Decode from the stored wire format.
    pub fn from_wire(raw: &str) -> CacheResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
