//! Named async mutexes for capabilities that must not overlap.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

fn lock_map(map: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Map from arbitrary key to a mutex, created on first use.
///
/// A key is forgotten again once its last guard drops with nobody waiting.
///
/// ```
/// # async fn demo() {
/// let locks = steward_server::KeyedLocks::default();
/// let _deploy = locks.lock("deploy").await;
/// assert!(locks.try_lock("deploy").is_none());
/// assert!(locks.try_lock("backup").is_some());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl KeyedLocks {
    fn mutex(&self, key: &str) -> Arc<AsyncMutex<()>> {
        lock_map(&self.inner).entry(key.to_string()).or_default().clone()
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> KeyGuard {
        KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            map: self.inner.clone(),
        }
    }

    /// Waits for the lock named `key`. Released when the guard drops.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        trace!(key, "Acquiring lock");
        let guard = self.mutex(key).lock_owned().await;
        self.guard(key, guard)
    }

    /// Takes the lock named `key` if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        match self.mutex(key).try_lock_owned() {
            Ok(guard) => Some(self.guard(key, guard)),
            Err(_) => {
                forget_if_idle(&self.inner, key);
                None
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_map(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_map(&self.inner).is_empty()
    }
}

/// Holds one key of a [`KeyedLocks`].
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        forget_if_idle(&self.map, &self.key);
    }
}

/// Drops `key` from the map when the map holds the only reference to it.
/// Waiters and guards each keep a clone.
fn forget_if_idle(map: &Mutex<LockMap>, key: &str) {
    let mut map = lock_map(map);
    if map.get(key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
        map.remove(key);
        trace!(key, "Lock forgotten");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = KeyedLocks::default();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("deploy").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let locks = KeyedLocks::default();
        let _a = locks.lock("a").await;
        assert!(locks.try_lock("a").is_none());
        let b = locks.try_lock("b");
        assert!(b.is_some());
        drop(b);
        assert!(locks.try_lock("b").is_some());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let locks = KeyedLocks::default();
        for i in 0..100 {
            let guard = locks.lock(&format!("host-{i}")).await;
            assert_eq!(guard.key(), format!("host-{i}"));
        }
        assert!(locks.is_empty());

        // a waiter keeps the key alive after the holder lets go
        let held = locks.lock("deploy").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("deploy").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());

        // a failed try_lock does not leave anything behind either
        let held = locks.try_lock("backup").unwrap();
        assert!(locks.try_lock("backup").is_none());
        drop(held);
        assert!(locks.is_empty());
    }
}
