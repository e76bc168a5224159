//! Distributed lock over the broker KV: SET NX EX with a scripted
//! compare-and-delete release so only the owner can unlock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock; `false` means another owner holds it.
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Release only if still owned; `false` means the lock had already
    /// expired or changed hands.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        let acquired = reply.is_some();
        debug!(key, owner, acquired, "lock acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(released > 0)
    }
}

/// Process-local lock for tests.
#[derive(Default)]
pub struct MemoryLock {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, (_, expires)| *expires > Instant::now());
        if locks.contains_key(key) {
            return Ok(false);
        }
        locks
            .insert(key.to_owned(), (owner.to_owned(), Instant::now() + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(key) {
            Some((held_by, _)) if held_by == owner => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_is_exclusive_per_key() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);
        assert!(lock.acquire("email_worker:1:lock", "a", ttl).await.unwrap());
        assert!(!lock.acquire("email_worker:1:lock", "b", ttl).await.unwrap());
        assert!(lock.acquire("email_worker:2:lock", "b", ttl).await.unwrap());

        // Only the owner may release.
        assert!(!lock.release("email_worker:1:lock", "b").await.unwrap());
        assert!(lock.release("email_worker:1:lock", "a").await.unwrap());
        assert!(lock.acquire("email_worker:1:lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_locks_can_be_retaken() {
        let lock = MemoryLock::new();
        assert!(
            lock.acquire("k", "a", Duration::from_millis(0)).await.unwrap()
        );
        assert!(
            lock.acquire("k", "b", Duration::from_secs(30)).await.unwrap()
        );
    }
}
