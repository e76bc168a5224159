//! In-memory repository implementations.
//!
//! Stateful doubles for the integration suites; they mirror the database
//! constraints (idempotency key uniqueness, Message-ID uniqueness,
//! at-most-one pending suggestion per natural key) so dispatcher and
//! workflow logic exercises the same conflict paths as production.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_model::{
    AttachmentRow, EmailAccount, EventRow, EventStatus, IntentCatalogEntry,
    RawMailRecord, SuggestionKind, SuggestionRecord, SuggestionStatus,
};
use uuid::Uuid;

use super::ports::{
    AccountRepository, EventRepository, InsertOutcome, IntentRepository,
    RawMailRepository, SuggestionRepository,
};
use crate::error::{CoreError, Result};

#[derive(Default)]
pub struct InMemoryEventRepository {
    rows: Mutex<Vec<EventRow>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<EventRow> {
        self.rows.lock().unwrap().clone()
    }

    fn update<F: FnOnce(&mut EventRow)>(&self, id: Uuid, f: F) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("event {id}")))?;
        f(row);
        Ok(())
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<EventRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.idempotency_key == key)
            .cloned())
    }

    async fn insert_pending(&self, row: &EventRow) -> Result<InsertOutcome> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.idempotency_key == row.idempotency_key) {
            return Ok(InsertOutcome::Duplicate);
        }
        rows.push(row.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_processing(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |row| {
            if row.status == EventStatus::Pending {
                row.status = EventStatus::Processing;
                row.processed_at = Some(at);
            }
        })
    }

    async fn record_classification(
        &self,
        id: Uuid,
        intent: &str,
        confidence: f64,
        reasoning: &str,
    ) -> Result<()> {
        self.update(id, |row| {
            row.intent = Some(intent.to_owned());
            row.confidence = Some(confidence);
            row.reasoning = Some(reasoning.to_owned());
        })
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        workflow_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |row| {
            row.status = EventStatus::Completed;
            row.workflow_id = workflow_id.map(str::to_owned);
            row.completed_at = Some(at);
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |row| {
            row.status = EventStatus::Failed;
            row.error_message = Some(error.to_owned());
            row.completed_at = Some(at);
        })
    }

    async fn set_response(&self, id: Uuid, response: &str) -> Result<()> {
        self.update(id, |row| {
            row.response_content = Some(response.to_owned());
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventRow>> {
        Ok(self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn count_by_status(&self, status: EventStatus) -> Result<i64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == status)
            .count() as i64)
    }
}

#[derive(Default)]
pub struct InMemoryRawMailRepository {
    mails: Mutex<Vec<RawMailRecord>>,
    attachments: Mutex<Vec<AttachmentRow>>,
}

impl InMemoryRawMailRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mail_count(&self) -> usize {
        self.mails.lock().unwrap().len()
    }
}

#[async_trait]
impl RawMailRepository for InMemoryRawMailRepository {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<RawMailRecord>> {
        Ok(self
            .mails
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned())
    }

    async fn insert(&self, record: &RawMailRecord) -> Result<()> {
        let mut mails = self.mails.lock().unwrap();
        if mails.iter().any(|m| m.message_id == record.message_id) {
            return Err(CoreError::Conflict(format!(
                "mail already persisted: {}",
                record.message_id
            )));
        }
        mails.push(record.clone());
        Ok(())
    }

    async fn insert_attachment(&self, row: &AttachmentRow) -> Result<()> {
        self.attachments.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn attachments_for(
        &self,
        mail_id: Uuid,
    ) -> Result<Vec<AttachmentRow>> {
        Ok(self
            .attachments
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.mail_id == mail_id)
            .cloned()
            .collect())
    }

    async fn attachment(&self, id: Uuid) -> Result<Option<AttachmentRow>> {
        Ok(self
            .attachments
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn attachments_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<AttachmentRow>> {
        let mail_ids: Vec<Uuid> = self
            .mails
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.event_id == Some(event_id))
            .map(|m| m.id)
            .collect();
        Ok(self
            .attachments
            .lock()
            .unwrap()
            .iter()
            .filter(|a| mail_ids.contains(&a.mail_id))
            .cloned()
            .collect())
    }

    async fn mark_processed(
        &self,
        mail_id: Uuid,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut mails = self.mails.lock().unwrap();
        let mail = mails
            .iter_mut()
            .find(|m| m.id == mail_id)
            .ok_or_else(|| CoreError::NotFound(format!("mail {mail_id}")))?;
        mail.event_id = Some(event_id);
        mail.processed_at = Some(at);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIntentRepository {
    entries: Mutex<Vec<IntentCatalogEntry>>,
}

impl InMemoryIntentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<IntentCatalogEntry>) -> Self {
        Self { entries: Mutex::new(entries) }
    }
}

#[async_trait]
impl IntentRepository for InMemoryIntentRepository {
    async fn list_active(&self) -> Result<Vec<IntentCatalogEntry>> {
        let mut entries: Vec<IntentCatalogEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.active)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    async fn find(&self, name: &str) -> Result<Option<IntentCatalogEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn insert(&self, entry: &IntentCatalogEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.name == entry.name) {
            return Err(CoreError::Conflict(format!(
                "intent already exists: {}",
                entry.name
            )));
        }
        entries.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySuggestionRepository {
    rows: Mutex<Vec<SuggestionRecord>>,
    materialized: Mutex<Vec<(SuggestionKind, String)>>,
}

impl InMemorySuggestionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn materialized(&self) -> Vec<(SuggestionKind, String)> {
        self.materialized.lock().unwrap().clone()
    }
}

#[async_trait]
impl SuggestionRepository for InMemorySuggestionRepository {
    async fn find_pending_by_key(
        &self,
        kind: SuggestionKind,
        natural_key: &str,
    ) -> Result<Option<SuggestionRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.kind == kind
                    && r.natural_key == natural_key
                    && r.status == SuggestionStatus::Pending
            })
            .cloned())
    }

    async fn insert(
        &self,
        record: &SuggestionRecord,
    ) -> Result<InsertOutcome> {
        let mut rows = self.rows.lock().unwrap();
        let duplicate = rows.iter().any(|r| {
            r.kind == record.kind
                && r.natural_key == record.natural_key
                && r.status == SuggestionStatus::Pending
        });
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }
        rows.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(
        &self,
        kind: SuggestionKind,
        id: Uuid,
    ) -> Result<Option<SuggestionRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.kind == kind && r.id == id)
            .cloned())
    }

    async fn update_review(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        status: SuggestionStatus,
        reviewer: &str,
        note: Option<&str>,
        reviewed_at: DateTime<Utc>,
        created_entity_id: Option<&str>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.kind == kind && r.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("suggestion {id}")))?;
        row.status = status;
        row.reviewer_id = Some(reviewer.to_owned());
        row.review_note = note.map(str::to_owned);
        row.reviewed_at = Some(reviewed_at);
        row.created_entity_id = created_entity_id.map(str::to_owned);
        Ok(())
    }

    async fn set_workflow(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        workflow_id: &str,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.kind == kind && r.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("suggestion {id}")))?;
        row.workflow_id = Some(workflow_id.to_owned());
        Ok(())
    }

    async fn list(
        &self,
        kind: Option<SuggestionKind>,
        status: Option<SuggestionStatus>,
        page: u32,
        size: u32,
    ) -> Result<Vec<SuggestionRecord>> {
        let mut rows: Vec<SuggestionRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip((page as usize) * (size as usize))
            .take(size as usize)
            .collect())
    }

    async fn count_pending(&self) -> Result<i64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == SuggestionStatus::Pending)
            .count() as i64)
    }

    async fn materialize(&self, record: &SuggestionRecord) -> Result<String> {
        let entity_id = record.payload.natural_key();
        self.materialized
            .lock()
            .unwrap()
            .push((record.kind, entity_id.clone()));
        Ok(entity_id)
    }
}

#[derive(Default)]
pub struct InMemoryAccountRepository {
    accounts: Mutex<Vec<EmailAccount>>,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<EmailAccount>) -> Self {
        Self { accounts: Mutex::new(accounts) }
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn list_active_imap(&self) -> Result<Vec<EmailAccount>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.active)
            .cloned()
            .collect())
    }
}
