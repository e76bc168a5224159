//! Per-account fetch checkpoints in the broker KV.
//!
//! Keys follow `email_worker:{account}:last_check`; values are RFC 3339
//! timestamps. The fetcher is the single writer while it holds the
//! account lock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::{CoreError, Result};

fn checkpoint_key(account: &str) -> String {
    format!("email_worker:{account}:last_check")
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, account: &str) -> Result<Option<DateTime<Utc>>>;

    /// Advance the checkpoint; never moves it backwards.
    async fn advance(&self, account: &str, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisCheckpointStore {
    conn: ConnectionManager,
}

impl RedisCheckpointStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, account: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(checkpoint_key(account)).await?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    CoreError::Internal(format!(
                        "corrupt checkpoint for {account}: {e}"
                    ))
                })
        })
        .transpose()
    }

    async fn advance(&self, account: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(current) = self.get(account).await?
            && current >= at
        {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(checkpoint_key(account), at.to_rfc3339())
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, account: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.checkpoints.lock().unwrap().get(account).copied())
    }

    async fn advance(&self, account: &str, at: DateTime<Utc>) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        let entry = checkpoints.entry(account.to_owned()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn checkpoints_are_monotonic() {
        let store = MemoryCheckpointStore::new();
        let earlier = Utc.with_ymd_and_hms(2025, 5, 2, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 5, 2, 11, 0, 0).unwrap();

        assert_eq!(store.get("1").await.unwrap(), None);
        store.advance("1", later).await.unwrap();
        store.advance("1", earlier).await.unwrap();
        assert_eq!(store.get("1").await.unwrap(), Some(later));
    }
}
