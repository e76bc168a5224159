//! Opaque token store backing signed URLs for the local-disk backend.
//!
//! Tokens live in the broker KV so every replica validates uniformly; a
//! process-local map backs tests. Deployment precondition: multi-replica
//! setups must use the shared store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::Result;

const TOKEN_PREFIX: &str = "storage:token:";

/// Mint a fresh opaque URL token.
pub(crate) fn mint_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
pub trait UrlTokenStore: Send + Sync {
    /// Bind `token` to `key` for `ttl`.
    async fn put(&self, token: &str, key: &str, ttl: Duration) -> Result<()>;

    /// The key a live token authorizes, if any.
    async fn lookup(&self, token: &str) -> Result<Option<String>>;
}

/// Broker-backed token store (SET EX / GET).
#[derive(Clone)]
pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl RedisTokenStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl UrlTokenStore for RedisTokenStore {
    async fn put(&self, token: &str, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            format!("{TOKEN_PREFIX}{token}"),
            key,
            ttl.as_secs().max(1),
        )
        .await?;
        Ok(())
    }

    async fn lookup(&self, token: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let key: Option<String> =
            conn.get(format!("{TOKEN_PREFIX}{token}")).await?;
        Ok(key)
    }
}

/// Process-local token store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UrlTokenStore for MemoryTokenStore {
    async fn put(&self, token: &str, key: &str, ttl: Duration) -> Result<()> {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.retain(|_, (_, expires)| *expires > Instant::now());
        tokens.insert(
            token.to_owned(),
            (key.to_owned(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn lookup(&self, token: &str) -> Result<Option<String>> {
        let tokens = self.tokens.lock().unwrap();
        Ok(tokens
            .get(token)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(key, _)| key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_tokens_expire() {
        let store = MemoryTokenStore::new();
        store.put("t1", "emails/raw/x.eml", Duration::from_secs(60)).await.unwrap();
        assert_eq!(
            store.lookup("t1").await.unwrap().as_deref(),
            Some("emails/raw/x.eml")
        );

        store.put("t2", "other", Duration::from_millis(0)).await.unwrap();
        assert_eq!(store.lookup("t2").await.unwrap(), None);
        assert_eq!(store.lookup("missing").await.unwrap(), None);
    }

    #[test]
    fn minted_tokens_are_unique() {
        assert_ne!(mint_token(), mint_token());
        assert_eq!(mint_token().len(), 32);
    }
}
