//! Workflow runtime and the built-in workflow definitions.
//!
//! Long-running, signalable, queryable instances with durable timers,
//! activities under retry policies, and child workflows. Instances are
//! driven by the runtime, not the OS scheduler: an awaiting workflow
//! consumes no thread. State snapshots and timer deadlines persist
//! through the state repository so non-terminal instances resume after a
//! restart.

pub mod approval;
mod builtin;
mod runtime;
mod store;

pub use approval::{
    APPROVAL_WORKFLOW, ApprovalInput, ApprovalOutcomeSink, ApprovalResult,
    ApprovalStatus, ApprovalWorkflow, NoopOutcomeSink,
};
pub use builtin::{
    ESCALATION_APPROVAL_WORKFLOW, EscalationApprovalWorkflow, HandlerInput,
    MANUAL_REVIEW_WORKFLOW, ManualReviewWorkflow,
};
pub use runtime::{
    RetryPolicy, Signal, SignalOrDeadline, WorkflowContext,
    WorkflowDefinition, WorkflowHandle, WorkflowRuntime,
};
pub use store::{
    InMemoryWorkflowStateRepository, PostgresWorkflowStateRepository,
    RunStatus, WorkflowRun, WorkflowStateRepository,
};
