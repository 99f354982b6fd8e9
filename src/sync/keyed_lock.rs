//! Keyed Lock Registry
//!
//! A set of named async mutexes. Operations touching the same logical
//! resource path acquire the same key and are strictly serialized; waiters
//! are served in FIFO order.
//!
//! There is no ordering between different keys and no timeout. A holder that
//! never finishes (for example a backend call that hangs) stalls every
//! contender on that key indefinitely. Callers choose keys coarse enough to
//! cover the resources they touch; keys scoped differently (a pool key and a
//! volume-name key) do not exclude each other.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of named mutexes
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds a key until dropped or released
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyedGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the key explicitly
    pub fn release(self) {
        trace!("released lock '{}'", self.key);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Wait until no other task holds `key`, then hold it
    pub async fn acquire(&self, key: impl Into<String>) -> KeyedGuard {
        let key = key.into();
        let mutex = self.mutex_for(&key);
        let guard = mutex.lock_owned().await;
        trace!("acquired lock '{}'", key);
        KeyedGuard { key, _guard: guard }
    }

    /// Hold `key` only if it is free right now
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<KeyedGuard> {
        let key = key.into();
        let guard = self.mutex_for(&key).try_lock_owned().ok()?;
        Some(KeyedGuard { key, _guard: guard })
    }

    /// Whether some task currently holds `key`
    pub fn is_locked(&self, key: &str) -> bool {
        match self.locks.get(key) {
            Some(mutex) => mutex.value().try_lock().is_err(),
            None => false,
        }
    }

    /// Number of keys ever acquired
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = KeyedLocks::new();

        let guard = locks.acquire("ceph/rbd").await;
        assert_eq!(guard.key(), "ceph/rbd");
        assert!(locks.is_locked("ceph/rbd"));
        assert!(locks.try_acquire("ceph/rbd").is_none());

        guard.release();
        assert!(!locks.is_locked("ceph/rbd"));
        assert!(locks.try_acquire("ceph/rbd").is_some());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();

        let _pool = locks.acquire("ceph/rbd").await;
        let vol = locks.try_acquire("vol1");
        assert!(vol.is_some());
        assert!(!locks.is_locked("never-used"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire("vol1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.acquire("vol1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.acquire("vol1").await;
                guard.key().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), "vol1");
    }

    #[test]
    fn test_acquire_pending_while_held() {
        let locks = KeyedLocks::new();
        let held = locks.try_acquire("vol1").unwrap();

        let mut waiting = tokio_test::task::spawn(locks.acquire("vol1"));
        tokio_test::assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let guard = tokio_test::assert_ready!(waiting.poll());
        assert_eq!(guard.key(), "vol1");
    }
}
