//! In-memory event stream used by the integration suites.
//!
//! Mirrors consumer-group semantics closely enough to exercise the
//! dispatcher: entries are delivered to exactly one consumer per group,
//! unacknowledged entries stay pending for their consumer, and ack counts
//! are observable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{EventStream, GroupInfo, StreamEntry, StreamInfo};
use crate::error::Result;

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    /// entry id -> consumer currently holding it.
    pending: HashMap<String, String>,
    /// Total acknowledgements observed, for test assertions.
    acked: u64,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
pub struct InMemoryEventStream {
    state: Mutex<StreamState>,
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of acks a group has issued. Test observability only.
    pub fn ack_count(&self, group: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.groups.get(group).map(|g| g.acked).unwrap_or(0)
    }

    /// Re-deliver an already-appended entry id to the group, as a broker
    /// would after a consumer crash. Test hook for duplicate delivery.
    pub fn requeue(&self, group: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        let index = state.entries.iter().position(|e| e.id == id);
        if let (Some(index), Some(group)) =
            (index, state.groups.get_mut(group))
        {
            group.cursor = group.cursor.min(index);
            group.pending.remove(id);
        }
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn append_fields(
        &self,
        fields: Vec<(String, String)>,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        let fields: BTreeMap<String, String> = fields.into_iter().collect();
        state.entries.push(StreamEntry { id: id.clone(), fields });
        Ok(id)
    }

    async fn create_group(&self, group: &str, _start_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn read(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock().unwrap();
        let total = state.entries.len();
        let group_state =
            state.groups.entry(group.to_owned()).or_default();

        let mut delivered = Vec::new();
        let mut cursor = group_state.cursor;
        while cursor < total && delivered.len() < count {
            cursor += 1;
            let entry = state.entries[cursor - 1].clone();
            let group_state = state.groups.get_mut(group).unwrap();
            if group_state.pending.contains_key(&entry.id) {
                continue;
            }
            group_state
                .pending
                .insert(entry.id.clone(), consumer.to_owned());
            delivered.push(entry);
        }
        state.groups.get_mut(group).unwrap().cursor = cursor;
        Ok(delivered)
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let state = self.state.lock().unwrap();
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .filter(|e| {
                group_state.pending.get(&e.id).map(String::as_str)
                    == Some(consumer)
            })
            .take(count)
            .cloned()
            .collect())
    }

    async fn ack(&self, group: &str, id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(false);
        };
        group_state.acked += 1;
        Ok(group_state.pending.remove(id).is_some())
    }

    async fn stream_info(&self) -> Result<StreamInfo> {
        let state = self.state.lock().unwrap();
        Ok(StreamInfo { length: state.entries.len() as u64 })
    }

    async fn group_info(&self, group: &str) -> Result<GroupInfo> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .get(group)
            .map(|g| GroupInfo {
                pending: g.pending.len() as u64,
                consumers: g
                    .pending
                    .values()
                    .collect::<std::collections::HashSet<_>>()
                    .len() as u64,
            })
            .unwrap_or_default())
    }
}
