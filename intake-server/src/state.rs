//! Shared state behind the HTTP surface.

use std::sync::Arc;

use intake_core::db::{EventRepository, SuggestionRepository};
use intake_core::mail::MailPersistor;
use intake_core::storage::LocalDiskStore;
use intake_core::stream::EventStream;
use intake_core::workers::Supervisor;
use redis::aio::ConnectionManager;
use sqlx::PgPool;

pub struct AppState {
    pub pool: PgPool,
    pub redis: ConnectionManager,
    pub stream: Arc<dyn EventStream>,
    pub events: Arc<dyn EventRepository>,
    pub persistor: Arc<MailPersistor>,
    pub suggestions_repo: Arc<dyn SuggestionRepository>,
    pub supervisor: Arc<Supervisor>,
    pub local_store: Option<Arc<LocalDiskStore>>,
}
