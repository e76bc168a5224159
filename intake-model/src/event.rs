//! The unified event: the canonical in-system representation of an inbound
//! message, independent of which channel produced it.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Email,
    Chat,
    Webhook,
    Command,
    Approval,
    Schedule,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Email => "email",
            EventType::Chat => "chat",
            EventType::Webhook => "webhook",
            EventType::Command => "command",
            EventType::Approval => "approval",
            EventType::Schedule => "schedule",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(EventType::Email),
            "chat" => Ok(EventType::Chat),
            "webhook" => Ok(EventType::Webhook),
            "command" => Ok(EventType::Command),
            "approval" => Ok(EventType::Approval),
            "schedule" => Ok(EventType::Schedule),
            other => Err(ModelError::InvalidField {
                field: "event_type",
                reason: format!("unknown event type: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Email,
    #[serde(rename = "chat-platform")]
    ChatPlatform,
    Web,
    Webhook,
    Schedule,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Email => "email",
            EventSource::ChatPlatform => "chat-platform",
            EventSource::Web => "web",
            EventSource::Webhook => "webhook",
            EventSource::Schedule => "schedule",
        }
    }
}

impl Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(EventSource::Email),
            "chat-platform" => Ok(EventSource::ChatPlatform),
            "web" => Ok(EventSource::Web),
            "webhook" => Ok(EventSource::Webhook),
            "schedule" => Ok(EventSource::Schedule),
            other => Err(ModelError::InvalidField {
                field: "source",
                reason: format!("unknown source: {other}"),
            }),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Html,
    Markdown,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Html => "html",
            ContentType::Markdown => "markdown",
        }
    }
}

impl FromStr for ContentType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" | "" => Ok(ContentType::Text),
            "html" => Ok(ContentType::Html),
            "markdown" => Ok(ContentType::Markdown),
            other => Err(ModelError::InvalidField {
                field: "content_type",
                reason: format!("unknown content type: {other}"),
            }),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" | "" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(ModelError::InvalidField {
                field: "priority",
                reason: format!("unknown priority: {other}"),
            }),
        }
    }
}

/// Attachment metadata carried on the event. Informational on the wire;
/// the attachment table keyed by event id is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub inline: bool,
    pub signature: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

/// The canonical item flowing through the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub source: EventSource,
    pub source_id: Option<String>,
    pub content: String,
    pub content_type: ContentType,
    pub user_id: Option<String>,
    pub user_external_id: Option<String>,
    pub user_name: Option<String>,
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
    pub idempotency_key: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub context: BTreeMap<String, String>,
    pub attachments: Vec<AttachmentMeta>,
}

impl UnifiedEvent {
    /// Minimal event with the given identity; callers fill in the rest.
    pub fn new(
        event_type: EventType,
        source: EventSource,
        idempotency_key: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            source,
            source_id: None,
            content: content.into(),
            content_type: ContentType::Text,
            user_id: None,
            user_external_id: None,
            user_name: None,
            session_id: None,
            thread_id: None,
            idempotency_key: idempotency_key.into(),
            priority: Priority::Normal,
            timestamp,
            metadata: BTreeMap::new(),
            context: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Skipped
        )
    }

    /// Legal transitions: pending → processing → {completed|failed}, and
    /// pending → skipped for duplicate arrivals.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::Pending, EventStatus::Processing)
                | (EventStatus::Pending, EventStatus::Skipped)
                | (EventStatus::Processing, EventStatus::Completed)
                | (EventStatus::Processing, EventStatus::Failed)
        )
    }
}

impl FromStr for EventStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            "skipped" => Ok(EventStatus::Skipped),
            other => Err(ModelError::InvalidField {
                field: "status",
                reason: format!("unknown event status: {other}"),
            }),
        }
    }
}

/// Persistent twin of [`UnifiedEvent`]. Exactly one row per idempotency
/// key; only the dispatcher writes status transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: Uuid,
    pub idempotency_key: String,
    pub event_type: EventType,
    pub source: EventSource,
    pub source_id: Option<String>,
    pub content: String,
    pub content_type: ContentType,
    pub user_id: Option<String>,
    pub user_external_id: Option<String>,
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
    pub priority: Priority,
    pub status: EventStatus,
    pub intent: Option<String>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    pub workflow_id: Option<String>,
    pub response_content: Option<String>,
    pub error_message: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EventRow {
    /// A fresh `pending` row mirroring the event's ingestion-time fields.
    pub fn from_event(event: &UnifiedEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: event.event_id,
            idempotency_key: event.idempotency_key.clone(),
            event_type: event.event_type,
            source: event.source,
            source_id: event.source_id.clone(),
            content: event.content.clone(),
            content_type: event.content_type,
            user_id: event.user_id.clone(),
            user_external_id: event.user_external_id.clone(),
            session_id: event.session_id.clone(),
            thread_id: event.thread_id.clone(),
            priority: event.priority,
            status: EventStatus::Pending,
            intent: None,
            confidence: None,
            reasoning: None,
            workflow_id: None,
            response_content: None,
            error_message: None,
            metadata: event.metadata.clone(),
            context: event.context.clone(),
            created_at: now,
            processed_at: None,
            completed_at: None,
        }
    }
}
