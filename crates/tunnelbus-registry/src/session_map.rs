//! Concurrent map with atomic per-key get-or-create

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Concurrent map of live resources
///
/// Each key owns a slot that is initialized at most once. Concurrent callers of
/// [`get_or_try_create`](Self::get_or_try_create) on the same key wait for a
/// single creator and then share its value. A failed creation frees the slot
/// once no other caller is waiting on it, so the next caller retries.
pub struct SessionMap<K, V> {
    entries: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> SessionMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the value under `key`, creating it with `create` if absent
    ///
    /// The boolean is `true` only for the caller whose `create` produced the
    /// value; that caller owns the resource's background work.
    pub async fn get_or_try_create<F, Fut, E>(&self, key: K, create: F) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let slot = self.entries.entry(key.clone()).or_default();
            Arc::clone(&*slot)
        };

        let mut created = false;
        let result = cell
            .get_or_try_init(|| {
                created = true;
                create()
            })
            .await
            .cloned();

        match result {
            Ok(value) => Ok((value, created)),
            Err(e) => {
                self.discard_empty(&key, &cell);
                Err(e)
            }
        }
    }

    /// Drop the empty slot `cell` after a failed creation
    ///
    /// The slot stays while another caller still waits on it; that caller
    /// retries the creation and discards the slot itself if it fails too.
    fn discard_empty(&self, key: &K, cell: &Arc<OnceCell<V>>) {
        self.entries.remove_if(key, |_, current| {
            Arc::ptr_eq(current, cell) && !current.initialized() && Arc::strong_count(current) == 2
        });
    }

    /// Store `value` under `key`, returning the value it replaced
    pub fn set(&self, key: K, value: V) -> Option<V> {
        let cell = Arc::new(OnceCell::new_with(Some(value)));
        self.entries
            .insert(key, cell)
            .and_then(|previous| previous.get().cloned())
    }

    pub fn try_get(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.try_get(key).is_some()
    }

    /// Remove the entry under `key` unconditionally
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries
            .remove(key)
            .and_then(|(_, cell)| cell.get().cloned())
    }

    /// Remove the entry under `key` only if its value satisfies `predicate`
    ///
    /// Used by a resource's owning task to evict its own entry without
    /// touching a newer resource stored under the same key.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> bool {
        self.entries
            .remove_if(key, |_, cell| cell.get().is_some_and(predicate))
            .is_some()
    }

    /// Remove every entry, returning the initialized values
    pub fn drain(&self) -> Vec<V> {
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Number of initialized entries
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every initialized value
    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }
}

impl<K, V> Default for SessionMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_get_or_create_creates_once() {
        let map: Arc<SessionMap<String, usize>> = Arc::new(SessionMap::new());
        let creations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let map = map.clone();
            let creations = creations.clone();
            tasks.push(tokio::spawn(async move {
                map.get_or_try_create("host".to_string(), || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, ()>(creations.fetch_add(1, Ordering::SeqCst) + 100)
                })
                .await
                .unwrap()
            }));
        }

        let mut created_count = 0;
        for task in tasks {
            let (value, created) = task.await.unwrap();
            assert_eq!(value, 100);
            if created {
                created_count += 1;
            }
        }

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(created_count, 1);
    }

    #[tokio::test]
    async fn test_failed_create_reads_as_absent_and_retries() {
        let map: SessionMap<u16, &'static str> = SessionMap::new();

        let failed = map
            .get_or_try_create(8080, || async { Err::<&str, _>("refused") })
            .await;
        assert_eq!(failed, Err("refused"));
        assert_eq!(map.try_get(&8080), None);
        assert!(map.is_empty());

        let (value, created) = map
            .get_or_try_create(8080, || async { Ok::<_, &str>("listener") })
            .await
            .unwrap();
        assert_eq!(value, "listener");
        assert!(created);
    }

    #[tokio::test]
    async fn test_failed_creates_leave_no_slots() {
        let map: SessionMap<u32, u32> = SessionMap::new();

        for id in 0..1000 {
            let failed = map
                .get_or_try_create(id, || async { Err::<u32, _>("refused") })
                .await;
            assert!(failed.is_err());
        }

        assert_eq!(map.entries.len(), 0);
    }

    #[tokio::test]
    async fn test_waiter_retries_after_concurrent_failure() {
        let map: Arc<SessionMap<u16, u32>> = Arc::new(SessionMap::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel::<()>();

        let failing = {
            let map = map.clone();
            tokio::spawn(async move {
                map.get_or_try_create(1, || async move {
                    let _ = started_tx.send(());
                    let _ = fail_rx.await;
                    Err::<u32, _>("refused")
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let waiting = {
            let map = map.clone();
            tokio::spawn(async move {
                map.get_or_try_create(1, || async { Ok::<_, &str>(7) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fail_tx.send(()).unwrap();

        assert!(failing.await.unwrap().is_err());
        assert_eq!(waiting.await.unwrap(), Ok((7, true)));
        assert_eq!(map.try_get(&1), Some(7));
        assert_eq!(map.entries.len(), 1);
    }

    #[test]
    fn test_drain_empties_map() {
        let map: SessionMap<u16, u32> = SessionMap::new();
        map.set(1, 10);
        map.set(2, 20);

        let mut drained = map.drain();
        drained.sort();
        assert_eq!(drained, vec![10, 20]);
        assert!(map.is_empty());
        assert_eq!(map.entries.len(), 0);
    }

    #[tokio::test]
    async fn test_existing_value_is_returned_unchanged() {
        let map: SessionMap<String, u32> = SessionMap::new();
        map.set("a".into(), 1);

        let (value, created) = map
            .get_or_try_create("a".into(), || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert!(!created);
    }

    #[test]
    fn test_remove_if_only_evicts_matching_value() {
        let map: SessionMap<String, Arc<u32>> = SessionMap::new();
        let old = Arc::new(1);
        let new = Arc::new(1);

        map.set("host".into(), new.clone());
        assert!(!map.remove_if(&"host".to_string(), |v| Arc::ptr_eq(v, &old)));
        assert!(map.contains(&"host".to_string()));

        assert!(map.remove_if(&"host".to_string(), |v| Arc::ptr_eq(v, &new)));
        assert!(!map.contains(&"host".to_string()));
    }

    #[test]
    fn test_set_replaces_and_remove_returns_value() {
        let map: SessionMap<u16, u32> = SessionMap::new();
        assert_eq!(map.set(1, 10), None);
        assert_eq!(map.set(1, 11), Some(10));
        assert_eq!(map.values(), vec![11]);
        assert_eq!(map.remove(&1), Some(11));
        assert_eq!(map.remove(&1), None);
    }
}
