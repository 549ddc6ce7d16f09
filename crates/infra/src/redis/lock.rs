//! Redis advisory locks (`SET NX PX` with an owner token).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use workerman_scheduler::{LockError, LockManager};

/// Extends only while the caller still owns the lock.
const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Deletes only while the caller still owns the lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockManager {
    client: Arc<redis::Client>,
    token: String,
}

impl RedisLockManager {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Backend(format!("Redis connection error: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            token: uuid::Uuid::now_v7().to_string(),
        })
    }

    /// Owner token written as the lock value.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Backend(format!("Redis connection error: {e}")))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl LockManager for RedisLockManager {
    #[instrument(skip(self), err)]
    fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection()?;
        let set: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| LockError::Backend(format!("SET NX failed: {e}")))?;

        let acquired = set.is_some();
        debug!(lock = %name, acquired, "lock acquire");
        Ok(acquired)
    }

    #[instrument(skip(self), err)]
    fn extend(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection()?;
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(name)
            .arg(&self.token)
            .arg(ttl_millis(ttl))
            .invoke(&mut conn)
            .map_err(|e| LockError::Backend(format!("extend script failed: {e}")))?;
        Ok(extended == 1)
    }

    #[instrument(skip(self), err)]
    fn release(&self, name: &str) -> Result<(), LockError> {
        let mut conn = self.connection()?;
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(name)
            .arg(&self.token)
            .invoke(&mut conn)
            .map_err(|e| LockError::Backend(format!("release script failed: {e}")))?;
        debug!(lock = %name, released = released == 1, "lock release");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_manager_has_its_own_token() {
        let a = RedisLockManager::new("redis://127.0.0.1:6379").unwrap();
        let b = RedisLockManager::new("redis://127.0.0.1:6379").unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(120)), 120_000);
    }
}
