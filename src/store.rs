//! Shared key-value store capability
//!
//! A thin typed surface over the Redis-compatible cache tier. The engine
//! only ever talks to `StoreClient`; `RedisStore` is the production
//! implementation and `MemoryStore` a single-process stand-in with the
//! same TTL and compare-and-delete semantics, used by the test suites.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::CacheResult;

/// Lua script deleting a key only when it still holds the expected value.
/// Runs server-side so the check and the delete are one atomic step.
static COMPARE_AND_DELETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end
        "#,
    )
});

/// Typed operations the engine needs from the shared store.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch the raw value under a key.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a raw value with no expiry.
    async fn set(&self, key: &str, raw: &str) -> CacheResult<()>;

    /// Store a raw value with a physical TTL.
    async fn set_with_ttl(&self, key: &str, raw: &str, ttl: Duration) -> CacheResult<()>;

    /// Store a raw value with a TTL only if the key is currently absent.
    /// Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, raw: &str, ttl: Duration) -> CacheResult<bool>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remaining TTL in whole seconds: `-1` for no expiry, `-2` for an
    /// absent key. Used by tests and diagnostics.
    async fn ttl_secs(&self, key: &str) -> CacheResult<i64>;

    /// Atomically delete the key only if it still holds `expected`.
    /// Returns whether a delete happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> CacheResult<bool>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed store over a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server, e.g. `redis://localhost:6379`.
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(conn))
    }

    /// Wrap an already established connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw)
    }

    async fn set(&self, key: &str, raw: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, raw: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, raw: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ttl_secs(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    raw: String,
    deadline: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Single-process store with real deadlines and atomic compare-and-delete.
///
/// Keeps the same observable TTL semantics as Redis (`-1` no expiry, `-2`
/// absent) so the engine and its tests run without a server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn live_entry(&self, key: &str) -> Option<MemoryEntry> {
        let now = Instant::now();
        // Lazy expiry: an expired entry is removed on first touch.
        let expired = match self.data.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.clone()),
            None => return None,
        };
        if expired {
            self.data.remove_if(key, |_, e| e.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.live_entry(key).map(|e| e.raw))
    }

    async fn set(&self, key: &str, raw: &str) -> CacheResult<()> {
        self.data.insert(
            key.to_string(),
            MemoryEntry {
                raw: raw.to_string(),
                deadline: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, raw: &str, ttl: Duration) -> CacheResult<()> {
        self.data.insert(
            key.to_string(),
            MemoryEntry {
                raw: raw.to_string(),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, raw: &str, ttl: Duration) -> CacheResult<bool> {
        let now = Instant::now();
        let entry = MemoryEntry {
            raw: raw.to_string(),
            deadline: Some(now + ttl),
        };
        match self.data.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(entry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn ttl_secs(&self, key: &str) -> CacheResult<i64> {
        let now = Instant::now();
        match self.live_entry(key) {
            None => Ok(-2),
            Some(MemoryEntry { deadline: None, .. }) => Ok(-1),
            Some(MemoryEntry {
                deadline: Some(deadline),
                ..
            }) => {
                let remaining = deadline.saturating_duration_since(now);
                Ok(remaining.as_secs_f64().ceil() as i64)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let now = Instant::now();
        let removed = self
            .data
            .remove_if(key, |_, e| !e.is_expired(now) && e.raw == expected);
        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let store = MemoryStore::new();

        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_ttl_reporting() {
        let store = MemoryStore::new();

        assert_eq!(store.ttl_secs("missing").await.unwrap(), -2);

        store.set("forever", "v").await.unwrap();
        assert_eq!(store.ttl_secs("forever").await.unwrap(), -1);

        store
            .set_with_ttl("bounded", "v", Duration::from_secs(30))
            .await
            .unwrap();
        let ttl = store.ttl_secs("bounded").await.unwrap();
        assert!((29..=30).contains(&ttl), "ttl was {ttl}");
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl_secs("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_memory_set_if_absent() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "first", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "second", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_memory_set_if_absent_replaces_expired() {
        let store = MemoryStore::new();

        store
            .set_if_absent("k", "old", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store
            .set_if_absent("k", "new", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_memory_compare_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "token-a").await.unwrap();

        assert!(!store.compare_and_delete("k", "token-b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("token-a".to_string()));

        assert!(store.compare_and_delete("k", "token-a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        // Idempotent on an absent key.
        assert!(!store.compare_and_delete("k", "token-a").await.unwrap());
    }
}
