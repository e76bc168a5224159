//! Built-in handler workflow definitions the dispatcher points intents
//! at: the escalation hold and the manual-review park.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::approval::{APPROVAL_WORKFLOW, ApprovalInput, ApprovalResult};
use super::runtime::{RetryPolicy, WorkflowContext, WorkflowDefinition};
use crate::db::EventRepository;
use crate::error::{CoreError, Result};
use crate::notify::{Notification, Notifier};

pub const ESCALATION_APPROVAL_WORKFLOW: &str = "escalation_approval";
pub const MANUAL_REVIEW_WORKFLOW: &str = "manual_review";

/// Input both built-ins receive from the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerInput {
    pub event_id: Uuid,
    pub intent: String,
    pub subject: String,
    pub sender: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl HandlerInput {
    /// Subject/sender projections plus the largest numeric token, for
    /// approval context.
    pub fn from_event(
        event: &intake_model::UnifiedEvent,
        intent: &str,
    ) -> Self {
        let amount = intake_model::extract_amounts(&event.content)
            .into_iter()
            .fold(None, |max: Option<f64>, n| {
                Some(max.map_or(n, |m| m.max(n)))
            });
        Self {
            event_id: event.event_id,
            intent: intent.to_owned(),
            subject: event
                .metadata
                .get("subject")
                .cloned()
                .unwrap_or_default(),
            sender: event
                .user_external_id
                .clone()
                .unwrap_or_default(),
            content: event.content.clone(),
            amount,
        }
    }
}

/// Runs the approval workflow as a child and records the decision on the
/// event row.
pub struct EscalationApprovalWorkflow {
    events: Arc<dyn EventRepository>,
    approver: String,
    timeout_hours: f64,
}

impl EscalationApprovalWorkflow {
    pub fn new(
        events: Arc<dyn EventRepository>,
        approver: String,
        timeout_hours: f64,
    ) -> Self {
        Self { events, approver, timeout_hours }
    }
}

#[async_trait]
impl WorkflowDefinition for EscalationApprovalWorkflow {
    fn workflow_type(&self) -> &'static str {
        ESCALATION_APPROVAL_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value> {
        let input: HandlerInput = serde_json::from_value(input)?;

        let approval_input = ApprovalInput {
            request_id: input.event_id.to_string(),
            request_type: "event_escalation".into(),
            requester: input.sender.clone(),
            approver: self.approver.clone(),
            title: input.subject.clone(),
            description: input.content.clone(),
            amount: input.amount,
            timeout_hours: self.timeout_hours,
            metadata: Some(json!({"intent": input.intent})),
        };

        let child_id = format!("approval-{}", input.event_id);
        let result = ctx
            .run_child(
                APPROVAL_WORKFLOW,
                &child_id,
                serde_json::to_value(&approval_input)?,
            )
            .await?;
        let decision: ApprovalResult =
            serde_json::from_value(result.clone())?;

        let events = self.events.clone();
        let event_id = input.event_id;
        let response = serde_json::to_string(&decision)?;
        ctx.run_activity(
            "record_decision",
            &RetryPolicy::notification(),
            move || {
                let events = events.clone();
                let response = response.clone();
                async move {
                    events.set_response(event_id, &response).await
                }
            },
        )
        .await?;

        ctx.record_state(json!({"decision": decision.status}), None).await;
        Ok(result)
    }
}

/// Parks an event for human action: notify the operator address and
/// complete. Mirrors the "await manual processing" path.
pub struct ManualReviewWorkflow {
    notifier: Arc<dyn Notifier>,
    operators: String,
}

impl ManualReviewWorkflow {
    pub fn new(notifier: Arc<dyn Notifier>, operators: String) -> Self {
        Self { notifier, operators }
    }
}

#[async_trait]
impl WorkflowDefinition for ManualReviewWorkflow {
    fn workflow_type(&self) -> &'static str {
        MANUAL_REVIEW_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value> {
        let input: HandlerInput = serde_json::from_value(input)?;
        if self.operators.is_empty() {
            return Err(CoreError::Workflow(
                "manual review has no operator address".into(),
            ));
        }

        let notifier = self.notifier.clone();
        let notification = Notification {
            to: self.operators.clone(),
            subject: format!("[Manual review] {}", input.subject),
            body: format!(
                "Event {} from {} classified as '{}' needs a human.\n\n{}",
                input.event_id, input.sender, input.intent, input.content,
            ),
        };
        ctx.run_activity(
            "notify_operators",
            &RetryPolicy::notification(),
            move || {
                let notifier = notifier.clone();
                let notification = notification.clone();
                async move { notifier.notify(&notification).await }
            },
        )
        .await?;

        ctx.record_state(json!({"status": "parked"}), None).await;
        Ok(json!({"status": "parked", "event_id": input.event_id}))
    }
}

#[cfg(test)]
mod tests {
    use super::super::approval::{
        ApprovalStatus, ApprovalWorkflow, NoopOutcomeSink,
    };
    use super::super::runtime::WorkflowRuntime;
    use super::super::store::InMemoryWorkflowStateRepository;
    use super::*;
    use crate::db::InMemoryEventRepository;
    use crate::notify::MemoryNotifier;
    use chrono::Utc;
    use intake_model::{EventRow, EventSource, EventType, UnifiedEvent};

    #[tokio::test(start_paused = true)]
    async fn escalation_runs_child_approval_and_records_decision() {
        let events = Arc::new(InMemoryEventRepository::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let runtime = WorkflowRuntime::new(Arc::new(
            InMemoryWorkflowStateRepository::new(),
        ));
        runtime.register(Arc::new(ApprovalWorkflow::new(
            notifier.clone(),
            Arc::new(NoopOutcomeSink),
        )));
        runtime.register(Arc::new(EscalationApprovalWorkflow::new(
            events.clone(),
            "ops@intake.example".into(),
            24.0,
        )));

        let event = UnifiedEvent::new(
            EventType::Email,
            EventSource::Email,
            "email:<esc-1>",
            "Target price 50000 USD total.",
            Utc::now(),
        );
        let row = EventRow::from_event(&event, Utc::now());
        events.insert_pending(&row).await.unwrap();

        let input = HandlerInput {
            event_id: event.event_id,
            intent: "inquiry".into(),
            subject: "Big RFQ".into(),
            sender: "buyer@ex.com".into(),
            content: event.content.clone(),
            amount: Some(50_000.0),
        };
        let handle = runtime
            .start(
                ESCALATION_APPROVAL_WORKFLOW,
                &format!("escalation_approval-{}", event.event_id),
                serde_json::to_value(&input).unwrap(),
            )
            .await
            .unwrap();

        // The child sends the approver notification; approve it once the
        // child instance is resident.
        let child_id = format!("approval-{}", event.event_id);
        let mut delivered = false;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if runtime
                .signal(
                    &child_id,
                    "approve",
                    json!({"reviewer_id": "mgr", "comment": "go ahead"}),
                )
                .await
                .is_ok()
            {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "child approval workflow never became signalable");

        let result: ApprovalResult =
            serde_json::from_value(handle.result().await.unwrap()).unwrap();
        assert_eq!(result.status, ApprovalStatus::Approved);

        let stored = events.get(event.event_id).await.unwrap().unwrap();
        let response = stored.response_content.unwrap();
        assert!(response.contains("approved"));
        assert!(response.contains("mgr"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_review_notifies_operators() {
        let notifier = Arc::new(MemoryNotifier::new());
        let runtime = WorkflowRuntime::new(Arc::new(
            InMemoryWorkflowStateRepository::new(),
        ));
        runtime.register(Arc::new(ManualReviewWorkflow::new(
            notifier.clone(),
            "ops@intake.example".into(),
        )));

        let input = HandlerInput {
            event_id: Uuid::new_v4(),
            intent: "other".into(),
            subject: "hello".into(),
            sender: "someone@ex.com".into(),
            content: "just saying hi".into(),
            amount: None,
        };
        let handle = runtime
            .start(
                MANUAL_REVIEW_WORKFLOW,
                &format!("manual_review-{}", input.event_id),
                serde_json::to_value(&input).unwrap(),
            )
            .await
            .unwrap();
        let result = handle.result().await.unwrap();
        assert_eq!(result["status"], json!("parked"));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("Manual review"));
        assert_eq!(sent[0].to, "ops@intake.example");
    }
}
