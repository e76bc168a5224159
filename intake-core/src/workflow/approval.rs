//! The approval workflow: notify the approver, hold for a decision or a
//! timeout, record the outcome, resume the parent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::runtime::{
    RetryPolicy, SignalOrDeadline, WorkflowContext, WorkflowDefinition,
};
use crate::error::{CoreError, Result};
use crate::notify::{Notification, Notifier};

pub const APPROVAL_WORKFLOW: &str = "approval";

pub const APPROVE_SIGNAL: &str = "approve";
pub const REJECT_SIGNAL: &str = "reject";
pub const DETAILS_QUERY: &str = "get_details";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub request_id: String,
    pub request_type: String,
    pub requester: String,
    /// Address the notification activity targets.
    pub approver: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub timeout_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Notifying,
    Awaiting,
    Approved,
    Rejected,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Records the terminal decision on the linked domain row (suggestion,
/// event, ...). Outside the workflow's own concern.
#[async_trait]
pub trait ApprovalOutcomeSink: Send + Sync {
    async fn record(
        &self,
        input: &ApprovalInput,
        result: &ApprovalResult,
    ) -> Result<()>;
}

pub struct NoopOutcomeSink;

#[async_trait]
impl ApprovalOutcomeSink for NoopOutcomeSink {
    async fn record(
        &self,
        _input: &ApprovalInput,
        _result: &ApprovalResult,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct ApprovalWorkflow {
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn ApprovalOutcomeSink>,
}

impl ApprovalWorkflow {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn ApprovalOutcomeSink>,
    ) -> Self {
        Self { notifier, sink }
    }

    fn details(
        input: &ApprovalInput,
        status: ApprovalStatus,
        reviewer_id: Option<&str>,
        comment: Option<&str>,
    ) -> Value {
        json!({
            DETAILS_QUERY: {
                "status": status,
                "request_id": input.request_id,
                "approver_id": reviewer_id,
                "comment": comment,
            },
            "notified": !matches!(status, ApprovalStatus::Notifying),
        })
    }

    async fn finish(
        &self,
        ctx: &WorkflowContext,
        input: &ApprovalInput,
        result: ApprovalResult,
    ) -> Result<Value> {
        // Terminal state is recorded via an activity so transient sink
        // failures retry rather than losing the decision.
        let sink = self.sink.clone();
        let retry_input = input.clone();
        let retry_result = result.clone();
        let recorded = ctx
            .run_activity(
                "record_outcome",
                &RetryPolicy::notification(),
                move || {
                    let sink = sink.clone();
                    let input = retry_input.clone();
                    let result = retry_result.clone();
                    async move { sink.record(&input, &result).await }
                },
            )
            .await;
        match recorded {
            Ok(()) => {}
            Err(e @ CoreError::Cancelled(_)) => return Err(e),
            // The decision stands even if the sink stays down; operators
            // see the stuck domain row.
            Err(e) => {
                warn!(
                    workflow_id = %ctx.workflow_id(),
                    error = %e,
                    "outcome sink exhausted retries"
                );
            }
        }

        ctx.record_state(
            Self::details(
                input,
                result.status,
                result.reviewer_id.as_deref(),
                result.comment.as_deref(),
            ),
            None,
        )
        .await;
        info!(
            workflow_id = %ctx.workflow_id(),
            request_id = %input.request_id,
            status = ?result.status,
            "approval finished"
        );
        Ok(serde_json::to_value(&result)?)
    }
}

#[async_trait]
impl WorkflowDefinition for ApprovalWorkflow {
    fn workflow_type(&self) -> &'static str {
        APPROVAL_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value> {
        let input: ApprovalInput = serde_json::from_value(input)?;

        // A recovered instance that already sent its notification skips
        // straight to the hold.
        let already_notified = ctx
            .recovered_state()
            .and_then(|state| state.get("notified"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !already_notified {
            ctx.record_state(
                Self::details(&input, ApprovalStatus::Notifying, None, None),
                None,
            )
            .await;

            let notifier = self.notifier.clone();
            let notification = Notification {
                to: input.approver.clone(),
                subject: format!("[Approval required] {}", input.title),
                body: format!(
                    "{}\n\nRequested by: {}\nRequest: {} ({}){}",
                    input.description,
                    input.requester,
                    input.request_id,
                    input.request_type,
                    input
                        .amount
                        .map(|amount| format!("\nAmount: {amount}"))
                        .unwrap_or_default(),
                ),
            };
            let notified = ctx
                .run_activity(
                    "notify_approver",
                    &RetryPolicy::notification(),
                    move || {
                        let notifier = notifier.clone();
                        let notification = notification.clone();
                        async move { notifier.notify(&notification).await }
                    },
                )
                .await;
            if let Err(e) = notified {
                if matches!(e, CoreError::Cancelled(_)) {
                    return Err(e);
                }
                return self
                    .finish(&ctx, &input, ApprovalResult {
                        status: ApprovalStatus::Failed,
                        reviewer_id: None,
                        comment: Some(format!("notification failed: {e}")),
                        decided_at: Utc::now(),
                    })
                    .await;
            }
        }

        // Durable timer: a recovered instance resumes with the remaining
        // window, not a fresh one.
        let deadline = ctx.recovered_deadline().unwrap_or_else(|| {
            Utc::now()
                + ChronoDuration::milliseconds(
                    (input.timeout_hours * 3_600_000.0) as i64,
                )
        });
        ctx.record_state(
            Self::details(&input, ApprovalStatus::Awaiting, None, None),
            Some(deadline),
        )
        .await;

        loop {
            match ctx.signal_or_deadline(Some(deadline)).await {
                SignalOrDeadline::Signal(signal) => {
                    let reviewer_id = signal
                        .args
                        .get("reviewer_id")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    let comment = signal
                        .args
                        .get("comment")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    let status = match signal.name.as_str() {
                        APPROVE_SIGNAL => ApprovalStatus::Approved,
                        REJECT_SIGNAL => ApprovalStatus::Rejected,
                        other => {
                            warn!(
                                workflow_id = %ctx.workflow_id(),
                                signal = other,
                                "unknown signal ignored"
                            );
                            continue;
                        }
                    };
                    return self
                        .finish(&ctx, &input, ApprovalResult {
                            status,
                            reviewer_id,
                            comment,
                            decided_at: Utc::now(),
                        })
                        .await;
                }
                SignalOrDeadline::DeadlineElapsed => {
                    return self
                        .finish(&ctx, &input, ApprovalResult {
                            status: ApprovalStatus::TimedOut,
                            reviewer_id: None,
                            comment: None,
                            decided_at: Utc::now(),
                        })
                        .await;
                }
                SignalOrDeadline::Cancelled => {
                    return Err(CoreError::Cancelled(format!(
                        "approval {} cancelled",
                        input.request_id
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::runtime::WorkflowRuntime;
    use super::super::store::InMemoryWorkflowStateRepository;
    use super::*;
    use crate::notify::MemoryNotifier;

    fn input(timeout_hours: f64) -> Value {
        serde_json::to_value(ApprovalInput {
            request_id: "req-1".into(),
            request_type: "new_intent".into(),
            requester: "dispatcher".into(),
            approver: "ops@intake.example".into(),
            title: "New intent: inquiry".into(),
            description: "Proposed by the classifier".into(),
            amount: None,
            timeout_hours,
            metadata: None,
        })
        .unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn runtime_with(
        notifier: Arc<MemoryNotifier>,
    ) -> Arc<WorkflowRuntime> {
        let runtime = WorkflowRuntime::new(Arc::new(
            InMemoryWorkflowStateRepository::new(),
        ));
        runtime.register(Arc::new(ApprovalWorkflow::new(
            notifier,
            Arc::new(NoopOutcomeSink),
        )));
        runtime
    }

    #[tokio::test(start_paused = true)]
    async fn approve_wins_and_later_signals_are_ignored() {
        let notifier = Arc::new(MemoryNotifier::new());
        let runtime = runtime_with(notifier.clone());
        let handle = runtime
            .start(APPROVAL_WORKFLOW, "approval-req-1", input(24.0))
            .await
            .unwrap();

        // Let the notification activity run.
        settle().await;
        assert_eq!(notifier.sent().len(), 1);

        handle
            .signal(
                APPROVE_SIGNAL,
                json!({"reviewer_id": "u1", "comment": "ok"}),
            )
            .await
            .unwrap();
        let result: ApprovalResult =
            serde_json::from_value(handle.result().await.unwrap()).unwrap();
        assert_eq!(result.status, ApprovalStatus::Approved);
        assert_eq!(result.reviewer_id.as_deref(), Some("u1"));
        assert_eq!(result.comment.as_deref(), Some("ok"));

        // The late reject is absorbed; the decision stands.
        handle
            .signal(
                REJECT_SIGNAL,
                json!({"reviewer_id": "u2", "comment": "late"}),
            )
            .await
            .unwrap();
        let details = handle.query(DETAILS_QUERY).await.unwrap();
        assert_eq!(details["status"], json!("approved"));
        assert_eq!(details["approver_id"], json!("u1"));
        assert_eq!(details["comment"], json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn unsignaled_workflow_times_out() {
        let runtime = runtime_with(Arc::new(MemoryNotifier::new()));
        let handle = runtime
            .start(APPROVAL_WORKFLOW, "approval-req-2", input(0.01))
            .await
            .unwrap();

        let result: ApprovalResult =
            serde_json::from_value(handle.result().await.unwrap()).unwrap();
        assert_eq!(result.status, ApprovalStatus::TimedOut);

        let details = handle.query(DETAILS_QUERY).await.unwrap();
        assert_eq!(details["status"], json!("timed_out"));
    }

    #[tokio::test(start_paused = true)]
    async fn notification_retry_exhaustion_fails_the_request() {
        let notifier = Arc::new(MemoryNotifier::new());
        notifier.fail_next(3);
        let runtime = runtime_with(notifier.clone());
        let handle = runtime
            .start(APPROVAL_WORKFLOW, "approval-req-3", input(24.0))
            .await
            .unwrap();

        let result: ApprovalResult =
            serde_json::from_value(handle.result().await.unwrap()).unwrap();
        assert_eq!(result.status, ApprovalStatus::Failed);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_resumes_the_hold_with_the_stored_deadline() {
        use super::super::store::{
            RunStatus, WorkflowRun, WorkflowStateRepository,
        };

        let store = Arc::new(InMemoryWorkflowStateRepository::new());
        let notifier = Arc::new(MemoryNotifier::new());

        // Snapshot left behind by a process that crashed mid-hold: the
        // notification already went out, the timer is armed.
        let deadline = Utc::now() + ChronoDuration::seconds(90);
        store
            .insert(&WorkflowRun {
                workflow_id: "approval-req-4".into(),
                workflow_type: APPROVAL_WORKFLOW.into(),
                input: input(24.0),
                status: RunStatus::Running,
                state: json!({
                    DETAILS_QUERY: {
                        "status": "awaiting",
                        "request_id": "req-1",
                        "approver_id": null,
                        "comment": null,
                    },
                    "notified": true,
                }),
                result: None,
                deadline: Some(deadline),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let runtime = WorkflowRuntime::new(store.clone());
        runtime.register(Arc::new(ApprovalWorkflow::new(
            notifier.clone(),
            Arc::new(NoopOutcomeSink),
        )));
        let resumed = runtime.recover().await.unwrap();
        assert_eq!(resumed, 1);

        let result: ApprovalResult = serde_json::from_value(
            runtime.result("approval-req-4").await.unwrap(),
        )
        .unwrap();
        assert_eq!(result.status, ApprovalStatus::TimedOut);
        // The notification is not re-sent on recovery, and the stored
        // deadline (not a fresh 24h window) bounded the wait.
        assert!(notifier.sent().is_empty());
    }
}
