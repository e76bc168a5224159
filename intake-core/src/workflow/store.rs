//! Workflow instance snapshots: the durability layer behind restart
//! recovery.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::db::InsertOutcome;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(CoreError::Workflow(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// Persisted snapshot of one workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub workflow_type: String,
    pub input: Value,
    pub status: RunStatus,
    /// Committed query state, keyed by query name.
    pub state: Value,
    pub result: Option<Value>,
    /// Durable timer deadline, when one is armed.
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkflowStateRepository: Send + Sync {
    /// Insert a fresh running row; an existing workflow id reports
    /// [`InsertOutcome::Duplicate`].
    async fn insert(&self, run: &WorkflowRun) -> Result<InsertOutcome>;

    async fn update_state(
        &self,
        workflow_id: &str,
        state: &Value,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn finish(
        &self,
        workflow_id: &str,
        status: RunStatus,
        result: Option<&Value>,
    ) -> Result<()>;

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowRun>>;

    async fn list_running(&self) -> Result<Vec<WorkflowRun>>;
}

/// PostgreSQL-backed implementation.
#[derive(Clone)]
pub struct PostgresWorkflowStateRepository {
    pool: PgPool,
}

impl PostgresWorkflowStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RunDto {
    workflow_id: String,
    workflow_type: String,
    input: Value,
    status: String,
    state: Value,
    result: Option<Value>,
    deadline: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunDto> for WorkflowRun {
    type Error = CoreError;

    fn try_from(dto: RunDto) -> Result<Self> {
        Ok(WorkflowRun {
            workflow_id: dto.workflow_id,
            workflow_type: dto.workflow_type,
            input: dto.input,
            status: dto.status.parse()?,
            state: dto.state,
            result: dto.result,
            deadline: dto.deadline,
            created_at: dto.created_at,
        })
    }
}

const COLUMNS: &str = "workflow_id, workflow_type, input, status, state, \
     result, deadline, created_at";

#[async_trait]
impl WorkflowStateRepository for PostgresWorkflowStateRepository {
    async fn insert(&self, run: &WorkflowRun) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                workflow_id, workflow_type, input, status, state, deadline,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (workflow_id) DO NOTHING
            "#,
        )
        .bind(&run.workflow_id)
        .bind(&run.workflow_type)
        .bind(&run.input)
        .bind(run.status.as_str())
        .bind(&run.state)
        .bind(run.deadline)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn update_state(
        &self,
        workflow_id: &str,
        state: &Value,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_runs SET state = $2, deadline = $3, \
             updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .bind(state)
        .bind(deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        workflow_id: &str,
        status: RunStatus,
        result: Option<&Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_runs SET status = $2, result = $3, \
             deadline = NULL, updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .bind(status.as_str())
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        let dto: Option<RunDto> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM workflow_runs WHERE workflow_id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        dto.map(WorkflowRun::try_from).transpose()
    }

    async fn list_running(&self) -> Result<Vec<WorkflowRun>> {
        let dtos: Vec<RunDto> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM workflow_runs WHERE status = 'running' \
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        dtos.into_iter().map(WorkflowRun::try_from).collect()
    }
}

/// In-memory implementation for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryWorkflowStateRepository {
    runs: Mutex<HashMap<String, WorkflowRun>>,
}

impl InMemoryWorkflowStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStateRepository for InMemoryWorkflowStateRepository {
    async fn insert(&self, run: &WorkflowRun) -> Result<InsertOutcome> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.workflow_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        runs.insert(run.workflow_id.clone(), run.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_state(
        &self,
        workflow_id: &str,
        state: &Value,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(workflow_id) {
            run.state = state.clone();
            run.deadline = deadline;
        }
        Ok(())
    }

    async fn finish(
        &self,
        workflow_id: &str,
        status: RunStatus,
        result: Option<&Value>,
    ) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(workflow_id) {
            run.status = status;
            run.result = result.cloned();
            run.deadline = None;
        }
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.lock().unwrap().get(workflow_id).cloned())
    }

    async fn list_running(&self) -> Result<Vec<WorkflowRun>> {
        let mut running: Vec<WorkflowRun> = self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|run| run.status == RunStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(running)
    }
}
