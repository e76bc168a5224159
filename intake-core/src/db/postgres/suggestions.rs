use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_model::{
    SuggestionKind, SuggestionPayload, SuggestionRecord, SuggestionStatus,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::ports::{InsertOutcome, SuggestionRepository};
use crate::error::Result;

/// PostgreSQL-backed implementation of the `SuggestionRepository` port.
///
/// Each suggestion kind owns a table with an identical column shape and a
/// partial unique index enforcing at-most-one pending row per natural key.
#[derive(Clone)]
pub struct PostgresSuggestionRepository {
    pool: PgPool,
}

impl PostgresSuggestionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn table(kind: SuggestionKind) -> &'static str {
    match kind {
        SuggestionKind::NewIntent => "intent_suggestions",
        SuggestionKind::NewWorkType => "work_type_suggestions",
        SuggestionKind::NewCustomer => "customer_suggestions",
        SuggestionKind::NewContact => "contact_suggestions",
    }
}

#[derive(sqlx::FromRow)]
struct SuggestionDto {
    id: Uuid,
    natural_key: String,
    payload: serde_json::Value,
    status: String,
    workflow_id: Option<String>,
    source_event_id: Option<Uuid>,
    reviewer_id: Option<String>,
    review_note: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    created_entity_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl SuggestionDto {
    fn into_record(self, kind: SuggestionKind) -> Result<SuggestionRecord> {
        Ok(SuggestionRecord {
            id: self.id,
            kind,
            natural_key: self.natural_key,
            payload: serde_json::from_value(self.payload)?,
            status: self.status.parse()?,
            workflow_id: self.workflow_id,
            source_event_id: self.source_event_id,
            reviewer_id: self.reviewer_id,
            review_note: self.review_note,
            reviewed_at: self.reviewed_at,
            created_entity_id: self.created_entity_id,
            created_at: self.created_at,
        })
    }
}

const COLUMNS: &str = "id, natural_key, payload, status, workflow_id, \
     source_event_id, reviewer_id, review_note, reviewed_at, \
     created_entity_id, created_at";

#[async_trait]
impl SuggestionRepository for PostgresSuggestionRepository {
    async fn find_pending_by_key(
        &self,
        kind: SuggestionKind,
        natural_key: &str,
    ) -> Result<Option<SuggestionRecord>> {
        let dto: Option<SuggestionDto> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM {} \
             WHERE natural_key = $1 AND status = 'pending'",
            table(kind),
        ))
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(|dto| dto.into_record(kind)).transpose()
    }

    async fn insert(
        &self,
        record: &SuggestionRecord,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                id, natural_key, payload, status, workflow_id,
                source_event_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (natural_key) WHERE status = 'pending' DO NOTHING
            "#,
            table(record.kind),
        ))
        .bind(record.id)
        .bind(&record.natural_key)
        .bind(serde_json::to_value(&record.payload)?)
        .bind(record.status.as_str())
        .bind(&record.workflow_id)
        .bind(record.source_event_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn get(
        &self,
        kind: SuggestionKind,
        id: Uuid,
    ) -> Result<Option<SuggestionRecord>> {
        let dto: Option<SuggestionDto> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1",
            table(kind),
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(|dto| dto.into_record(kind)).transpose()
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
        sqlx::query(&format!(
            "UPDATE {} SET status = $2, reviewer_id = $3, review_note = $4, \
             reviewed_at = $5, created_entity_id = $6 WHERE id = $1",
            table(kind),
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(reviewer)
        .bind(note)
        .bind(reviewed_at)
        .bind(created_entity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_workflow(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        workflow_id: &str,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET workflow_id = $2 WHERE id = $1",
            table(kind),
        ))
        .bind(id)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        kind: Option<SuggestionKind>,
        status: Option<SuggestionStatus>,
        page: u32,
        size: u32,
    ) -> Result<Vec<SuggestionRecord>> {
        let kinds: Vec<SuggestionKind> = match kind {
            Some(kind) => vec![kind],
            None => vec![
                SuggestionKind::NewIntent,
                SuggestionKind::NewWorkType,
                SuggestionKind::NewCustomer,
                SuggestionKind::NewContact,
            ],
        };

        let mut records = Vec::new();
        for kind in kinds {
            let dtos: Vec<SuggestionDto> = match status {
                Some(status) => {
                    sqlx::query_as(&format!(
                        "SELECT {COLUMNS} FROM {} WHERE status = $1 \
                         ORDER BY created_at DESC",
                        table(kind),
                    ))
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as(&format!(
                        "SELECT {COLUMNS} FROM {} ORDER BY created_at DESC",
                        table(kind),
                    ))
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            for dto in dtos {
                records.push(dto.into_record(kind)?);
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = (page as usize) * (size as usize);
        Ok(records
            .into_iter()
            .skip(start)
            .take(size as usize)
            .collect())
    }

    async fn count_pending(&self) -> Result<i64> {
        let mut total = 0i64;
        for kind in [
            SuggestionKind::NewIntent,
            SuggestionKind::NewWorkType,
            SuggestionKind::NewCustomer,
            SuggestionKind::NewContact,
        ] {
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {} WHERE status = 'pending'",
                table(kind),
            ))
            .fetch_one(&self.pool)
            .await?;
            total += count;
        }
        Ok(total)
    }

    async fn materialize(&self, record: &SuggestionRecord) -> Result<String> {
        match &record.payload {
            SuggestionPayload::NewIntent {
                name,
                label,
                description,
                handler,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO intents (
                        name, label, description, exemplars, keywords,
                        priority, active, handler
                    )
                    VALUES ($1, $2, $3, '[]'::jsonb, '[]'::jsonb, 0, TRUE, $4)
                    ON CONFLICT (name) DO NOTHING
                    "#,
                )
                .bind(name)
                .bind(label)
                .bind(description)
                .bind(serde_json::to_value(handler)?)
                .execute(&self.pool)
                .await?;
                Ok(name.clone())
            }
            SuggestionPayload::NewWorkType { code, label, description } => {
                sqlx::query(
                    r#"
                    INSERT INTO work_types (code, label, description, active)
                    VALUES ($1, $2, $3, TRUE)
                    ON CONFLICT (code) DO NOTHING
                    "#,
                )
                .bind(code)
                .bind(label)
                .bind(description)
                .execute(&self.pool)
                .await?;
                Ok(code.clone())
            }
            SuggestionPayload::NewCustomer { name, email, country } => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO customers (id, name, email, country, created_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    "#,
                )
                .bind(id)
                .bind(name)
                .bind(email)
                .bind(country)
                .execute(&self.pool)
                .await?;
                Ok(id.to_string())
            }
            SuggestionPayload::NewContact { email, name, customer_name } => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO contacts (id, email, name, customer_name, created_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    "#,
                )
                .bind(id)
                .bind(email)
                .bind(name)
                .bind(customer_name)
                .execute(&self.pool)
                .await?;
                Ok(id.to_string())
            }
        }
    }
}
