//! Core data model definitions shared across Intake crates.

pub mod account;
pub mod error;
pub mod event;
pub mod intent;
pub mod mail;
pub mod storage;
pub mod suggestion;
pub mod wire;

// Intentionally curated re-exports for downstream consumers.
pub use account::EmailAccount;
pub use error::{ModelError, Result as ModelResult};
pub use event::{
    AttachmentMeta, ContentType, EventRow, EventSource, EventStatus,
    EventType, Priority, UnifiedEvent,
};
pub use intent::{
    EscalationRule, FALLBACK_INTENT, HandlerBinding, IntentCatalogEntry,
    extract_amounts,
};
pub use mail::{AttachmentRow, RawMailRecord};
pub use storage::{StorageBackend, StoragePointer};
pub use suggestion::{
    SuggestionKind, SuggestionPayload, SuggestionRecord, SuggestionStatus,
};
