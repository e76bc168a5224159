use async_trait::async_trait;
use intake_model::{EscalationRule, HandlerBinding, IntentCatalogEntry};
use sqlx::PgPool;

use crate::db::ports::IntentRepository;
use crate::error::{CoreError, Result};

/// PostgreSQL-backed implementation of the `IntentRepository` port.
#[derive(Clone)]
pub struct PostgresIntentRepository {
    pool: PgPool,
}

impl PostgresIntentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct IntentDto {
    name: String,
    label: String,
    description: String,
    exemplars: serde_json::Value,
    keywords: serde_json::Value,
    priority: i32,
    active: bool,
    handler: serde_json::Value,
    escalation: Option<serde_json::Value>,
    escalation_workflow: Option<String>,
}

impl TryFrom<IntentDto> for IntentCatalogEntry {
    type Error = CoreError;

    fn try_from(dto: IntentDto) -> Result<Self> {
        let handler: HandlerBinding = serde_json::from_value(dto.handler)?;
        let escalation: Option<EscalationRule> =
            dto.escalation.map(serde_json::from_value).transpose()?;
        Ok(IntentCatalogEntry {
            name: dto.name,
            label: dto.label,
            description: dto.description,
            exemplars: serde_json::from_value(dto.exemplars)?,
            keywords: serde_json::from_value(dto.keywords)?,
            priority: dto.priority,
            active: dto.active,
            handler,
            escalation,
            escalation_workflow: dto.escalation_workflow,
        })
    }
}

const COLUMNS: &str = "name, label, description, exemplars, keywords, \
     priority, active, handler, escalation, escalation_workflow";

#[async_trait]
impl IntentRepository for PostgresIntentRepository {
    async fn list_active(&self) -> Result<Vec<IntentCatalogEntry>> {
        let dtos: Vec<IntentDto> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM intents WHERE active \
             ORDER BY priority DESC, name"
        ))
        .fetch_all(&self.pool)
        .await?;
        dtos.into_iter().map(IntentCatalogEntry::try_from).collect()
    }

    async fn find(&self, name: &str) -> Result<Option<IntentCatalogEntry>> {
        let dto: Option<IntentDto> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM intents WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(IntentCatalogEntry::try_from).transpose()
    }

    async fn insert(&self, entry: &IntentCatalogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO intents (
                name, label, description, exemplars, keywords, priority,
                active, handler, escalation, escalation_workflow
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&entry.name)
        .bind(&entry.label)
        .bind(&entry.description)
        .bind(serde_json::to_value(&entry.exemplars)?)
        .bind(serde_json::to_value(&entry.keywords)?)
        .bind(entry.priority)
        .bind(entry.active)
        .bind(serde_json::to_value(&entry.handler)?)
        .bind(
            entry
                .escalation
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(&entry.escalation_workflow)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                CoreError::Conflict(format!(
                    "intent already exists: {}",
                    entry.name
                ))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }
}
