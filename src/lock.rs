//! Distributed locking over the shared store
//!
//! Advisory, token-guarded leases: acquisition is a store-side
//! set-if-absent with a TTL, release is an atomic compare-and-delete so a
//! holder can never delete a lock that has since expired and been taken by
//! someone else. The TTL bounds the wedge time left by a crashed holder;
//! there is no renewal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::StoreClient;

/// Proof of a currently held lease.
#[derive(Debug, Clone)]
pub struct LockLease {
    key: String,
    token: String,
}

impl LockLease {
    /// The lock key this lease covers.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The fencing token stored under the lock key.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Acquires and releases store-side lock leases.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn StoreClient>,
}

impl LockManager {
    /// Create a manager over the shared store.
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Try to take the lease without blocking. A store error counts as
    /// "not acquired" so an unreachable store degrades instead of failing
    /// the read path.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockLease> {
        let token = Uuid::new_v4().to_string();
        match self.store.set_if_absent(key, &token, ttl).await {
            Ok(true) => Some(LockLease {
                key: key.to_string(),
                token,
            }),
            Ok(false) => None,
            Err(err) => {
                warn!(key, %err, "lock acquisition failed against store");
                None
            }
        }
    }

    /// Release a lease. Deletes the lock key only if it still holds this
    /// lease's token; best-effort on store errors.
    pub async fn release(&self, lease: LockLease) {
        match self
            .store
            .compare_and_delete(&lease.key, &lease.token)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Lease expired and possibly re-acquired elsewhere.
                debug!(key = %lease.key, "lock already released or taken over");
            }
            Err(err) => {
                warn!(key = %lease.key, %err, "lock release failed against store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (LockManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (LockManager::new(store.clone() as Arc<dyn StoreClient>), store)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (locks, store) = manager();
        let ttl = Duration::from_secs(5);

        let lease = locks.try_acquire("lock:quotes:BTC", ttl).await.unwrap();
        assert_eq!(lease.key(), "lock:quotes:BTC");
        assert_eq!(
            store.get("lock:quotes:BTC").await.unwrap().as_deref(),
            Some(lease.token())
        );

        locks.release(lease).await;
        assert_eq!(store.get("lock:quotes:BTC").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contended_acquire_fails() {
        let (locks, _store) = manager();
        let ttl = Duration::from_secs(5);

        let _held = locks.try_acquire("lock:quotes:BTC", ttl).await.unwrap();
        assert!(locks.try_acquire("lock:quotes:BTC", ttl).await.is_none());
    }

    #[tokio::test]
    async fn test_release_does_not_delete_other_holders_lock() {
        let (locks, store) = manager();

        let stale = locks
            .try_acquire("lock:quotes:BTC", Duration::from_millis(10))
            .await
            .unwrap();

        // Lease expires; another worker takes over.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = locks
            .try_acquire("lock:quotes:BTC", Duration::from_secs(5))
            .await
            .unwrap();

        // The stale holder's release must leave the new lease in place.
        locks.release(stale).await;
        assert_eq!(
            store.get("lock:quotes:BTC").await.unwrap().as_deref(),
            Some(current.token())
        );
    }

    #[tokio::test]
    async fn test_tokens_are_unique_per_acquisition() {
        let (locks, _store) = manager();

        let first = locks
            .try_acquire("lock:quotes:A", Duration::from_secs(5))
            .await
            .unwrap();
        let second = locks
            .try_acquire("lock:quotes:B", Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(first.token(), second.token());
    }
}
