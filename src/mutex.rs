//! FIFO async mutex and a per-key registry of them.
//!
//! [`Mutex::lock`] runs a critical section with exclusive access. Waiters are granted the lock
//! in arrival order (tokio's mutex is fair), so no caller starves under sustained contention.
//! The guard is released when the critical section finishes, returns an error, or unwinds.
//!
//! [`KeyedLocks`] hands out one shared [`Mutex`] per bucket key. Lookup takes a read lock first
//! and only upgrades to a write lock when the key is missing; the write path re-checks through
//! the map entry so two racing callers always end up with the same `Arc<Mutex>`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// FIFO async lock guarding a critical section.
#[derive(Debug, Default)]
pub struct Mutex {
    inner: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
}

/// Decrements the waiter count even if the acquiring future is dropped mid-wait.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Mutex {
    /// Create an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `critical_section` while holding the lock.
    ///
    /// Whatever the section returns (including an `Err`) is handed back after the lock has been
    /// released.
    pub async fn lock<T, Fut, F>(&self, critical_section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _waiter = WaitGuard(&self.waiting);
            self.inner.lock().await
        };
        let out = critical_section().await;
        drop(guard);
        out
    }

    /// Whether some caller currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Number of callers queued behind the current holder.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Registry of per-key mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: RwLock<HashMap<String, Arc<Mutex>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex for `key`, creating it exactly once.
    pub async fn get_or_create(&self, key: &str) -> Arc<Mutex> {
        if let Some(existing) = self.locks.read().await.get(key) {
            return existing.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new())).clone()
    }

    /// Forget the mutex for `key`. Holders of the old `Arc` keep working on it.
    pub async fn remove(&self, key: &str) -> bool {
        self.locks.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.locks.write().await.clear();
    }

    /// Drop every mutex that nobody outside the registry holds and `keep` does not claim.
    ///
    /// A caller inside (or queued for) a critical section holds its own `Arc`, so its key is
    /// never pruned from under it.
    pub async fn prune_idle<F>(&self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|key, lock| Arc::strong_count(lock) > 1 || keep(key));
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn critical_sections_never_overlap() {
        let mutex = Arc::new(Mutex::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..20 {
            let mutex = mutex.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                mutex
                    .lock(|| async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in futures::future::join_all(handles).await {
            h.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        // Hold the lock so the spawned tasks queue up.
        let holder = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                mutex
                    .lock(|| async {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        while !mutex.is_locked() {
            tokio::task::yield_now().await;
        }

        let mut handles = vec![];
        for i in 0..5 {
            let task_mutex = mutex.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                task_mutex.lock(|| async { order.lock().unwrap().push(i) }).await
            }));
            // Make sure task `i` is enqueued before task `i + 1` starts.
            while mutex.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn error_propagates_and_lock_is_released() {
        let mutex = Mutex::new();
        let res: Result<(), &str> = mutex.lock(|| async { Err("boom") }).await;
        assert_eq!(res, Err("boom"));
        assert!(!mutex.is_locked());

        let ok = mutex.lock(|| async { 7 }).await;
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn panicking_section_releases_lock() {
        let mutex = Arc::new(Mutex::new());
        let m = mutex.clone();
        let joined = tokio::spawn(async move {
            m.lock(|| async {
                panic!("critical section failed");
            })
            .await
        })
        .await;
        assert!(joined.is_err());
        assert!(!mutex.is_locked());
        assert_eq!(mutex.lock(|| async { "free" }).await, "free");
    }

    #[tokio::test]
    async fn keyed_locks_create_one_mutex_per_key() {
        let locks = Arc::new(KeyedLocks::new());
        let mut handles = vec![];
        for _ in 0..32 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move { locks.get_or_create("user:a").await }));
        }
        let all: Vec<Arc<Mutex>> =
            futures::future::join_all(handles).await.into_iter().map(|h| h.unwrap()).collect();
        assert!(all.iter().all(|m| Arc::ptr_eq(m, &all[0])));
        assert_eq!(locks.len().await, 1);

        let other = locks.get_or_create("user:b").await;
        assert!(!Arc::ptr_eq(&other, &all[0]));
        assert!(locks.remove("user:a").await);
        assert!(!locks.remove("user:a").await);
        locks.clear().await;
        assert!(locks.is_empty().await);
    }

    #[tokio::test]
    async fn prune_idle_spares_held_and_claimed_keys() {
        let locks = KeyedLocks::new();
        let held = locks.get_or_create("user:held").await;
        locks.get_or_create("user:idle").await;
        locks.get_or_create("user:kept").await;

        assert_eq!(locks.prune_idle(|key| key == "user:kept").await, 1);
        assert_eq!(locks.len().await, 2);
        assert!(Arc::ptr_eq(&held, &locks.get_or_create("user:held").await));

        drop(held);
        assert_eq!(locks.prune_idle(|_| false).await, 2);
        assert!(locks.is_empty().await);
    }
}
