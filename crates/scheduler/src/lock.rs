//! Named, expiring advisory locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lock backend failure. Contention is not an error (`Ok(false)`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Advisory lock manager used to keep singleton loops unique.
///
/// A lock expires after its TTL unless extended, so a crashed holder never
/// blocks others forever.
pub trait LockManager: Send + Sync {
    /// Take `name` for `ttl`. Returns `false` when someone else holds it.
    fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Push the expiry of a lock this manager holds. Returns `false` when the
    /// lock expired or was taken over.
    fn extend(&self, name: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release a lock this manager holds. Releasing an unheld lock is a no-op.
    fn release(&self, name: &str) -> Result<(), LockError>;
}

impl<L> LockManager for Arc<L>
where
    L: LockManager + ?Sized,
{
    fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        (**self).acquire(name, ttl)
    }

    fn extend(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        (**self).extend(name, ttl)
    }

    fn release(&self, name: &str) -> Result<(), LockError> {
        (**self).release(name)
    }
}

/// In-process lock table for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.get(name).is_some_and(|expires| *expires > Instant::now())
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if locks.get(name).is_some_and(|expires| *expires > now) {
            return Ok(false);
        }
        locks.insert(name.to_string(), now + ttl);
        Ok(true)
    }

    fn extend(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match locks.get_mut(name) {
            Some(expires) if *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            Some(_) => {
                locks.remove(name);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn release(&self, name: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_acquire_fails_while_held() {
        let locks = InMemoryLockManager::new();
        assert!(locks.acquire("sched", Duration::from_secs(60)).unwrap());
        assert!(!locks.acquire("sched", Duration::from_secs(60)).unwrap());
        assert!(locks.acquire("other", Duration::from_secs(60)).unwrap());

        locks.release("sched").unwrap();
        assert!(locks.acquire("sched", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn expired_lock_can_be_taken_and_not_extended() {
        let locks = InMemoryLockManager::new();
        assert!(locks.acquire("sched", Duration::from_millis(10)).unwrap());
        thread::sleep(Duration::from_millis(30));

        assert!(!locks.is_held("sched"));
        assert!(!locks.extend("sched", Duration::from_secs(60)).unwrap());
        assert!(locks.acquire("sched", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn extend_keeps_a_live_lock() {
        let locks = InMemoryLockManager::new();
        assert!(locks.acquire("sched", Duration::from_millis(50)).unwrap());
        assert!(locks.extend("sched", Duration::from_secs(60)).unwrap());
        thread::sleep(Duration::from_millis(80));
        assert!(locks.is_held("sched"));
    }
}
