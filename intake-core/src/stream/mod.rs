//! Event stream over the broker, plus the distributed lock and checkpoint
//! key spaces the IMAP source shares with it.
//!
//! Delivery guarantee is at-least-once; the dispatcher compensates with
//! the event row's idempotency-key constraint.

mod checkpoint;
mod lock;
mod memory;
mod redis_stream;

pub use checkpoint::{
    CheckpointStore, MemoryCheckpointStore, RedisCheckpointStore,
};
pub use lock::{DistributedLock, MemoryLock, RedisLock};
pub use memory::InMemoryEventStream;
pub use redis_stream::RedisEventStream;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use intake_model::{UnifiedEvent, wire};

use crate::error::Result;

/// Primary stream key.
pub const EVENTS_STREAM: &str = "events:incoming";
/// Default consumer group.
pub const EVENT_PROCESSORS_GROUP: &str = "event-processors";
/// Approximate trim threshold for the primary stream.
pub const MAX_STREAM_LEN: usize = 10_000;

/// One delivered stream entry.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamInfo {
    pub length: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupInfo {
    pub pending: u64,
    pub consumers: u64,
}

/// Durable, consumer-grouped, acknowledgement-based queue.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append raw fields; used by tests to inject poison pills.
    async fn append_fields(
        &self,
        fields: Vec<(String, String)>,
    ) -> Result<String>;

    /// Append an encoded event; returns the broker entry id.
    async fn append(&self, event: &UnifiedEvent) -> Result<String> {
        self.append_fields(wire::encode(event)).await
    }

    /// Idempotent on an already-existing group.
    async fn create_group(&self, group: &str, start_id: &str) -> Result<()>;

    /// Read unread entries (`>` cursor) for this consumer, blocking up to
    /// `block`.
    async fn read(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Read entries previously delivered to this consumer but not yet
    /// acknowledged (`0` cursor).
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, group: &str, id: &str) -> Result<bool>;

    async fn stream_info(&self) -> Result<StreamInfo>;

    async fn group_info(&self, group: &str) -> Result<GroupInfo>;
}
