//! Redis Streams implementation of the event stream port.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply,
};
use tracing::debug;

use super::{
    EventStream, GroupInfo, MAX_STREAM_LEN, StreamEntry, StreamInfo,
};
use crate::error::Result;

#[derive(Clone)]
pub struct RedisEventStream {
    conn: ConnectionManager,
    stream: String,
    max_len: usize,
}

impl RedisEventStream {
    pub fn new(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self { conn, stream: stream.into(), max_len: MAX_STREAM_LEN }
    }

    fn entries_from(reply: StreamReadReply) -> Vec<StreamEntry> {
        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = BTreeMap::new();
                for (name, value) in id.map.iter() {
                    if let Ok(text) =
                        redis::from_redis_value::<String>(value.clone())
                    {
                        fields.insert(name.clone(), text);
                    }
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        entries
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn append_fields(
        &self,
        fields: Vec<(String, String)>,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &fields,
            )
            .await?;
        debug!(stream = %self.stream, id, "appended stream entry");
        Ok(id)
    }

    async fn create_group(&self, group: &str, start_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(&self.stream, group, start_id)
            .await;
        match created {
            Ok(_) => Ok(()),
            // The group already exists; nothing to do.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await?;
        Ok(Self::entries_from(reply))
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options =
            StreamReadOptions::default().group(group, consumer).count(count);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &["0"], &options)
            .await?;
        Ok(Self::entries_from(reply))
    }

    async fn ack(&self, group: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = conn.xack(&self.stream, group, &[id]).await?;
        Ok(acked > 0)
    }

    async fn stream_info(&self) -> Result<StreamInfo> {
        let mut conn = self.conn.clone();
        let length: u64 = conn.xlen(&self.stream).await?;
        Ok(StreamInfo { length })
    }

    async fn group_info(&self, group: &str) -> Result<GroupInfo> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply =
            conn.xpending(&self.stream, group).await?;
        Ok(match reply {
            StreamPendingReply::Empty => GroupInfo::default(),
            StreamPendingReply::Data(data) => GroupInfo {
                pending: data.count as u64,
                consumers: data.consumers.len() as u64,
            },
            _ => GroupInfo::default(),
        })
    }
}
