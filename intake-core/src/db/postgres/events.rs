use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_model::{EventRow, EventStatus};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::ports::{EventRepository, InsertOutcome};
use crate::error::{CoreError, Result};

/// PostgreSQL-backed implementation of the `EventRepository` port.
#[derive(Clone)]
pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EventRowDto {
    id: Uuid,
    idempotency_key: String,
    event_type: String,
    source: String,
    source_id: Option<String>,
    content: String,
    content_type: String,
    user_id: Option<String>,
    user_external_id: Option<String>,
    session_id: Option<String>,
    thread_id: Option<String>,
    priority: String,
    status: String,
    intent: Option<String>,
    confidence: Option<f64>,
    reasoning: Option<String>,
    workflow_id: Option<String>,
    response_content: Option<String>,
    error_message: Option<String>,
    metadata: serde_json::Value,
    context: serde_json::Value,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<EventRowDto> for EventRow {
    type Error = CoreError;

    fn try_from(dto: EventRowDto) -> Result<Self> {
        let metadata: BTreeMap<String, String> =
            serde_json::from_value(dto.metadata)?;
        let context: BTreeMap<String, String> =
            serde_json::from_value(dto.context)?;
        Ok(EventRow {
            id: dto.id,
            idempotency_key: dto.idempotency_key,
            event_type: dto.event_type.parse()?,
            source: dto.source.parse()?,
            source_id: dto.source_id,
            content: dto.content,
            content_type: dto.content_type.parse()?,
            user_id: dto.user_id,
            user_external_id: dto.user_external_id,
            session_id: dto.session_id,
            thread_id: dto.thread_id,
            priority: dto.priority.parse()?,
            status: dto.status.parse()?,
            intent: dto.intent,
            confidence: dto.confidence,
            reasoning: dto.reasoning,
            workflow_id: dto.workflow_id,
            response_content: dto.response_content,
            error_message: dto.error_message,
            metadata,
            context,
            created_at: dto.created_at,
            processed_at: dto.processed_at,
            completed_at: dto.completed_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, idempotency_key, event_type, source, \
     source_id, content, content_type, user_id, user_external_id, \
     session_id, thread_id, priority, status, intent, confidence, \
     reasoning, workflow_id, response_content, error_message, metadata, \
     context, created_at, processed_at, completed_at";

#[async_trait]
impl EventRepository for PostgresEventRepository {
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<EventRow>> {
        let dto: Option<EventRowDto> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(EventRow::try_from).transpose()
    }

    async fn insert_pending(&self, row: &EventRow) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, idempotency_key, event_type, source, source_id,
                content, content_type, user_id, user_external_id,
                session_id, thread_id, priority, status, metadata, context,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(&row.idempotency_key)
        .bind(row.event_type.as_str())
        .bind(row.source.as_str())
        .bind(&row.source_id)
        .bind(&row.content)
        .bind(row.content_type.as_str())
        .bind(&row.user_id)
        .bind(&row.user_external_id)
        .bind(&row.session_id)
        .bind(&row.thread_id)
        .bind(row.priority.as_str())
        .bind(row.status.as_str())
        .bind(serde_json::to_value(&row.metadata)?)
        .bind(serde_json::to_value(&row.context)?)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn mark_processing(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE events SET status = 'processing', processed_at = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_classification(
        &self,
        id: Uuid,
        intent: &str,
        confidence: f64,
        reasoning: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE events SET intent = $2, confidence = $3, reasoning = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(intent)
        .bind(confidence)
        .bind(reasoning)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        workflow_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE events SET status = 'completed', workflow_id = $2, \
             completed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(workflow_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE events SET status = 'failed', error_message = $2, \
             completed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_response(&self, id: Uuid, response: &str) -> Result<()> {
        sqlx::query("UPDATE events SET response_content = $2 WHERE id = $1")
            .bind(id)
            .bind(response)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventRow>> {
        let dto: Option<EventRowDto> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(EventRow::try_from).transpose()
    }

    async fn count_by_status(&self, status: EventStatus) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
