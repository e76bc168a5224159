//! Persistent rows produced by the raw-mail persistor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StoragePointer;

/// One fetched mail: provider identity, envelope metadata, the full body
/// text, and a pointer to the original RFC822 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMailRecord {
    pub id: Uuid,
    pub account_id: Option<i64>,
    /// Provider Message-ID, unique across the table.
    pub message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    /// Full body text, never truncated.
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    pub storage: StoragePointer,
    pub size_bytes: i64,
    /// Back-reference to the event row once the mail has been dispatched.
    pub event_id: Option<Uuid>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One stored attachment, exclusively owned by its parent mail record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRow {
    pub id: Uuid,
    pub mail_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage: StoragePointer,
    pub inline: bool,
    pub content_id: Option<String>,
    /// Inline image referenced by Content-ID from the HTML body; hidden
    /// from attachment listings.
    pub is_signature: bool,
    pub created_at: DateTime<Utc>,
}
