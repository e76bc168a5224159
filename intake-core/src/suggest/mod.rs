//! Suggestion review lifecycle: create pending proposals, approve (and
//! materialize the real entity), reject, list.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use intake_model::{
    SuggestionKind, SuggestionPayload, SuggestionRecord, SuggestionStatus,
};

use crate::db::{InsertOutcome, SuggestionRepository};
use crate::error::{CoreError, Result};
use crate::workflow::approval::{
    APPROVE_SIGNAL, ApprovalInput, ApprovalOutcomeSink, ApprovalResult,
    ApprovalStatus, REJECT_SIGNAL,
};
use crate::workflow::WorkflowRuntime;

pub struct SuggestionService {
    repo: Arc<dyn SuggestionRepository>,
    /// When present, reviews signal the attached approval workflow.
    runtime: Option<Arc<WorkflowRuntime>>,
}

impl SuggestionService {
    pub fn new(repo: Arc<dyn SuggestionRepository>) -> Self {
        Self { repo, runtime: None }
    }

    pub fn with_runtime(
        repo: Arc<dyn SuggestionRepository>,
        runtime: Arc<WorkflowRuntime>,
    ) -> Self {
        Self { repo, runtime: Some(runtime) }
    }

    /// Create a pending suggestion. At most one pending row exists per
    /// (kind, natural key); a duplicate create returns the existing id.
    pub async fn create(
        &self,
        payload: SuggestionPayload,
        source_event_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let kind = payload.kind();
        let natural_key = payload.natural_key();

        if let Some(existing) =
            self.repo.find_pending_by_key(kind, &natural_key).await?
        {
            return Ok(existing.id);
        }

        let record = SuggestionRecord {
            id: Uuid::new_v4(),
            kind,
            natural_key: natural_key.clone(),
            payload,
            status: SuggestionStatus::Pending,
            workflow_id: None,
            source_event_id,
            reviewer_id: None,
            review_note: None,
            reviewed_at: None,
            created_entity_id: None,
            created_at: Utc::now(),
        };

        match self.repo.insert(&record).await? {
            InsertOutcome::Inserted => {
                info!(
                    kind = %kind,
                    natural_key = %natural_key,
                    suggestion_id = %record.id,
                    "suggestion created"
                );
                Ok(record.id)
            }
            // Lost the insert race; the winner's row is the answer.
            InsertOutcome::Duplicate => self
                .repo
                .find_pending_by_key(kind, &natural_key)
                .await?
                .map(|record| record.id)
                .ok_or_else(|| {
                    CoreError::Internal(format!(
                        "pending {kind} suggestion for {natural_key} vanished"
                    ))
                }),
        }
    }

    /// Remember the approval-hold workflow attached to a suggestion.
    pub async fn attach_workflow(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        workflow_id: &str,
    ) -> Result<()> {
        self.repo.set_workflow(kind, id, workflow_id).await
    }

    /// Approve: materialize the proposed entity, stamp the review, and
    /// signal the attached workflow. Idempotent by status check.
    pub async fn approve(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        reviewer: &str,
        note: Option<&str>,
    ) -> Result<String> {
        let record = self.repo.get(kind, id).await?.ok_or_else(|| {
            CoreError::NotFound(format!("suggestion {id}"))
        })?;

        match record.status {
            SuggestionStatus::Approved => {
                return record.created_entity_id.ok_or_else(|| {
                    CoreError::Internal(format!(
                        "approved suggestion {id} has no created entity"
                    ))
                });
            }
            SuggestionStatus::Rejected | SuggestionStatus::Merged => {
                return Err(CoreError::Conflict(format!(
                    "suggestion {id} already reviewed: {}",
                    record.status.as_str()
                )));
            }
            SuggestionStatus::Pending => {}
        }

        let entity_id = self.repo.materialize(&record).await?;
        self.repo
            .update_review(
                kind,
                id,
                SuggestionStatus::Approved,
                reviewer,
                note,
                Utc::now(),
                Some(&entity_id),
            )
            .await?;
        info!(
            suggestion_id = %id,
            entity_id = %entity_id,
            reviewer,
            "suggestion approved"
        );

        self.signal_workflow(&record, APPROVE_SIGNAL, reviewer, note).await;
        Ok(entity_id)
    }

    /// Reject. Idempotent by status check.
    pub async fn reject(
        &self,
        kind: SuggestionKind,
        id: Uuid,
        reviewer: &str,
        note: Option<&str>,
    ) -> Result<()> {
        let record = self.repo.get(kind, id).await?.ok_or_else(|| {
            CoreError::NotFound(format!("suggestion {id}"))
        })?;

        match record.status {
            SuggestionStatus::Rejected => return Ok(()),
            SuggestionStatus::Approved | SuggestionStatus::Merged => {
                return Err(CoreError::Conflict(format!(
                    "suggestion {id} already reviewed: {}",
                    record.status.as_str()
                )));
            }
            SuggestionStatus::Pending => {}
        }

        self.repo
            .update_review(
                kind,
                id,
                SuggestionStatus::Rejected,
                reviewer,
                note,
                Utc::now(),
                None,
            )
            .await?;
        info!(suggestion_id = %id, reviewer, "suggestion rejected");

        self.signal_workflow(&record, REJECT_SIGNAL, reviewer, note).await;
        Ok(())
    }

    pub async fn list(
        &self,
        kind: Option<SuggestionKind>,
        status: Option<SuggestionStatus>,
        page: u32,
        size: u32,
    ) -> Result<Vec<SuggestionRecord>> {
        self.repo.list(kind, status, page, size).await
    }

    /// Names of pending new-intent proposals, for classifier dedupe.
    pub async fn pending_intent_names(&self) -> Result<Vec<String>> {
        Ok(self
            .repo
            .list(
                Some(SuggestionKind::NewIntent),
                Some(SuggestionStatus::Pending),
                0,
                200,
            )
            .await?
            .into_iter()
            .map(|record| record.natural_key)
            .collect())
    }

    /// Fire-and-forget: a failed signal never rolls back the review.
    async fn signal_workflow(
        &self,
        record: &SuggestionRecord,
        signal: &str,
        reviewer: &str,
        note: Option<&str>,
    ) {
        let (Some(runtime), Some(workflow_id)) =
            (&self.runtime, &record.workflow_id)
        else {
            return;
        };
        if let Err(e) = runtime
            .signal(
                workflow_id,
                signal,
                json!({"reviewer_id": reviewer, "comment": note}),
            )
            .await
        {
            warn!(
                workflow_id = %workflow_id,
                suggestion_id = %record.id,
                error = %e,
                "approval workflow signal failed"
            );
        }
    }
}

/// Bridges approval workflow decisions back onto the suggestion row the
/// hold was opened for. The workflow input's metadata carries the
/// suggestion coordinates.
pub struct SuggestionOutcomeSink {
    service: Arc<SuggestionService>,
}

impl SuggestionOutcomeSink {
    pub fn new(service: Arc<SuggestionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ApprovalOutcomeSink for SuggestionOutcomeSink {
    async fn record(
        &self,
        input: &ApprovalInput,
        result: &ApprovalResult,
    ) -> Result<()> {
        let Some(metadata) = &input.metadata else {
            return Ok(());
        };
        let (Some(kind), Some(id)) = (
            metadata
                .get("suggestion_kind")
                .and_then(serde_json::Value::as_str),
            metadata
                .get("suggestion_id")
                .and_then(serde_json::Value::as_str),
        ) else {
            return Ok(());
        };
        let kind: SuggestionKind = kind.parse()?;
        let id = Uuid::parse_str(id)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let reviewer =
            result.reviewer_id.as_deref().unwrap_or("approval-workflow");

        let recorded = match result.status {
            ApprovalStatus::Approved => self
                .service
                .approve(kind, id, reviewer, result.comment.as_deref())
                .await
                .map(|_| ()),
            ApprovalStatus::Rejected => {
                self.service
                    .reject(kind, id, reviewer, result.comment.as_deref())
                    .await
            }
            // Timeouts and failures leave the row pending for the admin
            // surface.
            _ => Ok(()),
        };
        match recorded {
            // A replayed decision meets an already-reviewed row.
            Err(CoreError::Conflict(_)) => Ok(()),
            other => other,
        }
    }
}
