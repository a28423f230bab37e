//! In-process load deduplication
//!
//! Concurrent misses for the same key inside one process elect a leader
//! that runs the loader; everyone else awaits the published outcome. The
//! wait is bounded: a follower that times out, or whose leader failed or
//! vanished, falls back to a direct load of its own. That trades perfect
//! deduplication for bounded tail latency.

use std::future::Future;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::error::CacheResult;

/// Leader outcome as seen by followers. `Err(())` tells a follower the
/// loader failed and it should bypass with its own load.
type Published<V> = Option<Result<Option<V>, ()>>;

enum Role<V> {
    Leader(watch::Sender<Published<V>>),
    Follower(watch::Receiver<Published<V>>),
}

/// Removes the in-flight entry when the leader finishes or is cancelled,
/// keeping the map at one live entry per key.
struct FlightGuard<'a, V> {
    map: &'a DashMap<String, watch::Receiver<Published<V>>>,
    key: &'a str,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        self.map.remove(self.key);
    }
}

/// Per-key coalescing of concurrent identical loads.
pub struct SingleFlight<V> {
    inflight: DashMap<String, watch::Receiver<Published<V>>>,
    wait: Duration,
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync,
{
    /// Create a coalescer with the given follower join timeout.
    pub fn new(wait: Duration) -> Self {
        Self {
            inflight: DashMap::new(),
            wait,
        }
    }

    /// Run `loader` for `key`, coalescing with any load already in
    /// flight. At least one caller per burst invokes the loader; others
    /// receive the same outcome or fall back to their own load.
    pub async fn run<F, Fut>(&self, key: &str, loader: F) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Option<V>>>,
    {
        let role = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Leader(tx) => {
                let guard = FlightGuard {
                    map: &self.inflight,
                    key,
                };
                let outcome = loader().await;
                // The entry must be gone before the outcome becomes
                // observable; a late joiner starts a fresh flight instead
                // of reading a completed one.
                drop(guard);
                let published = match &outcome {
                    Ok(value) => Some(Ok(value.clone())),
                    Err(_) => Some(Err(())),
                };
                let _ = tx.send(published);
                outcome
            }
            Role::Follower(mut rx) => {
                let outcome = match timeout(self.wait, rx.wait_for(|p| p.is_some())).await {
                    Ok(Ok(published)) => {
                        let outcome = (*published).clone();
                        drop(published);
                        outcome
                    }
                    Ok(Err(_)) => {
                        // Leader dropped without publishing.
                        debug!(key, "in-flight leader vanished, bypassing");
                        None
                    }
                    Err(_) => {
                        debug!(key, "in-flight wait timed out, bypassing");
                        None
                    }
                };
                match outcome {
                    Some(Ok(value)) => Ok(value),
                    // Leader's loader failed, the leader vanished, or the
                    // wait timed out; load for ourselves.
                    Some(Err(())) | None => loader().await,
                }
            }
        }
    }

    /// Number of loads currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let flights = Arc::new(SingleFlight::<String>::new(Duration::from_millis(500)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("quotes:HOT", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(Some("loaded".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value, Some("loaded".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_follower_falls_back_on_leader_failure() {
        let flights = Arc::new(SingleFlight::<String>::new(Duration::from_millis(500)));
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("quotes:FAIL", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(CacheError::Source("db down".to_string()))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower_calls = calls.clone();
        let follower = flights
            .run("quotes:FAIL", || async move {
                follower_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some("recovered".to_string()))
            })
            .await;

        assert!(leader.await.unwrap().is_err());
        assert_eq!(follower.unwrap(), Some("recovered".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_follower_times_out_and_bypasses() {
        let flights = Arc::new(SingleFlight::<u64>::new(Duration::from_millis(40)));

        let slow_flights = flights.clone();
        let leader = tokio::spawn(async move {
            slow_flights
                .run("quotes:SLOW", || async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(Some(1))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = flights
            .run("quotes:SLOW", || async { Ok(Some(2)) })
            .await
            .unwrap();

        // Follower gave up waiting and loaded on its own.
        assert_eq!(follower, Some(2));
        assert_eq!(leader.await.unwrap().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_entry_removed_when_leader_cancelled() {
        let flights = Arc::new(SingleFlight::<u64>::new(Duration::from_millis(50)));

        let hung_flights = flights.clone();
        let leader = tokio::spawn(async move {
            hung_flights
                .run("quotes:HUNG", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Some(1))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flights.inflight_count(), 1);
        leader.abort();
        let _ = leader.await;
        assert_eq!(flights.inflight_count(), 0);

        // The key is immediately usable again.
        let value = flights
            .run("quotes:HUNG", || async { Ok(Some(7)) })
            .await
            .unwrap();
        assert_eq!(value, Some(7));
    }
}
