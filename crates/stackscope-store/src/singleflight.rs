//! Per-key request coalescing.
//!
//! When several tasks need the same expensive result at the same time (an
//! archive open, a chunk fetch), the first caller becomes the leader and runs
//! the computation; everyone else subscribes to a broadcast channel and
//! receives the leader's result. Entries are removed on completion, success
//! or failure, so the coalescer never caches.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, SharedResult};

/// One coalescing space, keyed by `K`.
///
/// Values are cloned to every waiter, so `V` is typically an `Arc`.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, broadcast::Sender<SharedResult<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty coalescing space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether no computation is in flight.
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// Run `fut` for `key`, or wait for the already-running computation.
    ///
    /// The leader polls the future inline; followers wait on the broadcast.
    /// If the leader's task is dropped mid-flight, followers receive
    /// [`Error::CoalesceInterrupted`] rather than hanging.
    pub async fn run<F>(&self, key: K, fut: F) -> SharedResult<V>
    where
        F: Future<Output = SharedResult<V>>,
    {
        let role = {
            let mut inflight = self.inflight.lock();
            if let Some(tx) = inflight.get(&key) {
                // Subscribing under the lock guarantees the subscription
                // happens before the leader's removal-then-send.
                Role::Follower(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key.clone(), tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => {
                trace!("coalesced onto in-flight computation");
                rx.recv()
                    .await
                    .unwrap_or_else(|_| Err(Arc::new(Error::CoalesceInterrupted)))
            }
            Role::Leader(tx) => {
                // If the leader is cancelled at an await point inside `fut`,
                // the guard still clears the entry so the key does not wedge.
                let guard = ClearOnDrop { inflight: &self.inflight, key: &key };
                let result = fut.await;
                // Dropping the guard removes the entry before the broadcast,
                // so a caller arriving now leads a fresh episode.
                drop(guard);
                let _ = tx.send(result.clone());
                result
            }
        }
    }
}

enum Role<V> {
    Leader(broadcast::Sender<SharedResult<V>>),
    Follower(broadcast::Receiver<SharedResult<V>>),
}

struct ClearOnDrop<'a, K: Eq + Hash, V> {
    inflight: &'a Mutex<HashMap<K, broadcast::Sender<SharedResult<V>>>>,
    key: &'a K,
}

impl<K: Eq + Hash, V> Drop for ClearOnDrop<'_, K, V> {
    fn drop(&mut self) {
        self.inflight.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let flight = Arc::new(SingleFlight::<String, Arc<u64>>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(32));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                flight
                    .run("k".to_string(), async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(Arc::new(7u64))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(*handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_entry_cleared() {
        let flight = Arc::new(SingleFlight::<u32, Arc<()>>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                flight
                    .run(1, async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Err(Arc::new(Error::ArchiveNotFound))
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let follower = flight.run(1, async { Ok(Arc::new(())) }).await;

        assert!(matches!(*follower.unwrap_err(), Error::ArchiveNotFound));
        assert!(leader.await.unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_episodes_run_independently() {
        let flight = SingleFlight::<u32, u32>::new();
        let first = flight.run(9, async { Ok(1) }).await.unwrap();
        let second = flight.run(9, async { Ok(2) }).await.unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let flight = Arc::new(SingleFlight::<u32, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for key in 0..4 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flight
                    .run(key, async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(key)
                    })
                    .await
                    .unwrap()
            }));
        }
        for (key, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), key as u32);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
