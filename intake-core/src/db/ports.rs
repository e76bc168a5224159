//! Repository ports. Consumers accept these via constructor injection;
//! lifetime is process-wide, initialized once at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_model::{
    AttachmentRow, EmailAccount, EventRow, EventStatus, IntentCatalogEntry,
    RawMailRecord, SuggestionKind, SuggestionRecord, SuggestionStatus,
};
use uuid::Uuid;

use crate::error::Result;

/// Outcome of a constrained insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same unique key already exists; the write was
    /// absorbed.
    Duplicate,
}

/// Event rows. Only the dispatcher writes status transitions.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<EventRow>>;

    /// Insert a fresh `pending` row. A unique violation on the
    /// idempotency key reports [`InsertOutcome::Duplicate`].
    async fn insert_pending(&self, row: &EventRow) -> Result<InsertOutcome>;

    async fn mark_processing(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn record_classification(
        &self,
        id: Uuid,
        intent: &str,
        confidence: f64,
        reasoning: &str,
    ) -> Result<()>;

    async fn mark_completed(
        &self,
        id: Uuid,
        workflow_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_response(&self, id: Uuid, response: &str) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<EventRow>>;

    /// Operator counter: rows per status.
    async fn count_by_status(&self, status: EventStatus) -> Result<i64>;
}

/// Raw mail and attachment rows.
#[async_trait]
pub trait RawMailRepository: Send + Sync {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<RawMailRecord>>;

    async fn insert(&self, record: &RawMailRecord) -> Result<()>;

    async fn insert_attachment(&self, row: &AttachmentRow) -> Result<()>;

    async fn attachments_for(&self, mail_id: Uuid)
    -> Result<Vec<AttachmentRow>>;

    async fn attachment(&self, id: Uuid) -> Result<Option<AttachmentRow>>;

    /// Attachments keyed by event id; the authoritative source for
    /// consumers (the stream payload is informational only).
    async fn attachments_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<AttachmentRow>>;

    async fn mark_processed(
        &self,
        mail_id: Uuid,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// The classifier's label universe.
#[async_trait]
pub trait IntentRepository: Send + Sync {
    /// Active entries, sorted by priority descending.
    async fn list_active(&self) -> Result<Vec<IntentCatalogEntry>>;

    async fn find(&self, name: &str) -> Result<Option<IntentCatalogEntry>>;

    /// Insert a new catalog entry; unique on name.
    async fn insert(&self, entry: &IntentCatalogEntry) -> Result<()>;
}

/// Suggestion rows across all kinds.
#[async_trait]
pub trait SuggestionRepository: Send + Sync {
    async fn find_pending_by_key(
        &self,
        kind: SuggestionKind,
        natural_key: &str,
    ) -> Result<Option<SuggestionRecord>>;

    /// Insert; a pending-duplicate violation reports
    /// [`InsertOutcome::Duplicate`].
    async fn insert(&self, record: &SuggestionRecord)
    -> Result<InsertOutcome>;

    async fn get(
        &self,
        kind: SuggestionKind,
        id: Uuid,
    ) -> Result<Option<SuggestionRecord>>;

    async fn update_review(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        status: SuggestionStatus,
        reviewer: &str,
        note: Option<&str>,
        reviewed_at: DateTime<Utc>,
        created_entity_id: Option<&str>,
    ) -> Result<()>;

    async fn set_workflow(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        workflow_id: &str,
    ) -> Result<()>;

    async fn list(
        &self,
        kind: Option<SuggestionKind>,
        status: Option<SuggestionStatus>,
        page: u32,
        size: u32,
    ) -> Result<Vec<SuggestionRecord>>;

    /// Operator counter: pending rows across kinds.
    async fn count_pending(&self) -> Result<i64>;

    /// Kind-specific materialization target insert; returns the created
    /// entity id.
    async fn materialize(&self, record: &SuggestionRecord) -> Result<String>;
}

/// Mail account configuration rows.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn list_active_imap(&self) -> Result<Vec<EmailAccount>>;
}
