use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_model::{AttachmentRow, RawMailRecord, StoragePointer};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::ports::RawMailRepository;
use crate::error::{CoreError, Result};

/// PostgreSQL-backed implementation of the `RawMailRepository` port.
#[derive(Clone)]
pub struct PostgresRawMailRepository {
    pool: PgPool,
}

impl PostgresRawMailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RawMailDto {
    id: Uuid,
    account_id: Option<i64>,
    message_id: String,
    sender: String,
    sender_name: Option<String>,
    recipients: serde_json::Value,
    subject: String,
    body_text: String,
    received_at: DateTime<Utc>,
    storage_backend: String,
    storage_key: String,
    size_bytes: i64,
    event_id: Option<Uuid>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RawMailDto> for RawMailRecord {
    type Error = CoreError;

    fn try_from(dto: RawMailDto) -> Result<Self> {
        Ok(RawMailRecord {
            id: dto.id,
            account_id: dto.account_id,
            message_id: dto.message_id,
            sender: dto.sender,
            sender_name: dto.sender_name,
            recipients: serde_json::from_value(dto.recipients)?,
            subject: dto.subject,
            body_text: dto.body_text,
            received_at: dto.received_at,
            storage: StoragePointer {
                backend: dto.storage_backend.parse()?,
                key: dto.storage_key,
            },
            size_bytes: dto.size_bytes,
            event_id: dto.event_id,
            processed_at: dto.processed_at,
            created_at: dto.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentDto {
    id: Uuid,
    mail_id: Uuid,
    filename: String,
    content_type: String,
    size_bytes: i64,
    storage_backend: String,
    storage_key: String,
    is_inline: bool,
    content_id: Option<String>,
    is_signature: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<AttachmentDto> for AttachmentRow {
    type Error = CoreError;

    fn try_from(dto: AttachmentDto) -> Result<Self> {
        Ok(AttachmentRow {
            id: dto.id,
            mail_id: dto.mail_id,
            filename: dto.filename,
            content_type: dto.content_type,
            size_bytes: dto.size_bytes,
            storage: StoragePointer {
                backend: dto.storage_backend.parse()?,
                key: dto.storage_key,
            },
            inline: dto.is_inline,
            content_id: dto.content_id,
            is_signature: dto.is_signature,
            created_at: dto.created_at,
        })
    }
}

const MAIL_COLUMNS: &str = "id, account_id, message_id, sender, sender_name, \
     recipients, subject, body_text, received_at, storage_backend, \
     storage_key, size_bytes, event_id, processed_at, created_at";

const ATTACHMENT_COLUMNS: &str = "id, mail_id, filename, content_type, \
     size_bytes, storage_backend, storage_key, is_inline, content_id, \
     is_signature, created_at";

#[async_trait]
impl RawMailRepository for PostgresRawMailRepository {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<RawMailRecord>> {
        let dto: Option<RawMailDto> = sqlx::query_as(&format!(
            "SELECT {MAIL_COLUMNS} FROM email_raw_messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(RawMailRecord::try_from).transpose()
    }

    async fn insert(&self, record: &RawMailRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_raw_messages (
                id, account_id, message_id, sender, sender_name, recipients,
                subject, body_text, received_at, storage_backend,
                storage_key, size_bytes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.account_id)
        .bind(&record.message_id)
        .bind(&record.sender)
        .bind(&record.sender_name)
        .bind(serde_json::to_value(&record.recipients)?)
        .bind(&record.subject)
        .bind(&record.body_text)
        .bind(record.received_at)
        .bind(record.storage.backend.as_str())
        .bind(&record.storage.key)
        .bind(record.size_bytes)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                CoreError::Conflict(format!(
                    "mail already persisted: {}",
                    record.message_id
                ))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn insert_attachment(&self, row: &AttachmentRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_attachments (
                id, mail_id, filename, content_type, size_bytes,
                storage_backend, storage_key, is_inline, content_id,
                is_signature, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.id)
        .bind(row.mail_id)
        .bind(&row.filename)
        .bind(&row.content_type)
        .bind(row.size_bytes)
        .bind(row.storage.backend.as_str())
        .bind(&row.storage.key)
        .bind(row.inline)
        .bind(&row.content_id)
        .bind(row.is_signature)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attachments_for(
        &self,
        mail_id: Uuid,
    ) -> Result<Vec<AttachmentRow>> {
        let dtos: Vec<AttachmentDto> = sqlx::query_as(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM email_attachments \
             WHERE mail_id = $1 ORDER BY created_at, id"
        ))
        .bind(mail_id)
        .fetch_all(&self.pool)
        .await?;
        dtos.into_iter().map(AttachmentRow::try_from).collect()
    }

    async fn attachment(&self, id: Uuid) -> Result<Option<AttachmentRow>> {
        let dto: Option<AttachmentDto> = sqlx::query_as(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM email_attachments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(AttachmentRow::try_from).transpose()
    }

    async fn attachments_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<AttachmentRow>> {
        let dtos: Vec<AttachmentDto> = sqlx::query_as(&format!(
            "SELECT a.{} FROM email_attachments a \
             JOIN email_raw_messages m ON m.id = a.mail_id \
             WHERE m.event_id = $1 ORDER BY a.created_at, a.id",
            ATTACHMENT_COLUMNS.replace(", ", ", a."),
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        dtos.into_iter().map(AttachmentRow::try_from).collect()
    }

    async fn mark_processed(
        &self,
        mail_id: Uuid,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE email_raw_messages SET event_id = $2, processed_at = $3 \
             WHERE id = $1",
        )
        .bind(mail_id)
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
