//! The in-process workflow runtime.
//!
//! Definitions register by type name; instances are addressable by
//! workflow id and expose the start / signal / query / cancel /
//! await-result verbs. Restarting an existing id is an error. Signals to
//! a missing id fail; cancellation is cooperative and observed at the
//! next await point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{RunStatus, WorkflowRun, WorkflowStateRepository};
use crate::db::InsertOutcome;
use crate::error::{CoreError, Result};

/// Activity retry policy: exponential backoff between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub backoff: f64,
    pub attempts: u32,
}

impl RetryPolicy {
    /// The notification policy: 1s initial, 30s cap, doubling, 3 attempts.
    pub fn notification() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            backoff: 2.0,
            attempts: 3,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            backoff: 1.0,
            attempts: 1,
        }
    }
}

/// A durable asynchronous message to a running instance.
#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    pub args: Value,
}

/// What ended a wait on signal-or-timer.
#[derive(Debug)]
pub enum SignalOrDeadline {
    Signal(Signal),
    DeadlineElapsed,
    Cancelled,
}

/// A workflow body. `run` executes once per instance; on recovery it is
/// re-invoked with the persisted snapshot available through the context,
/// so bodies are written to be idempotent across their current step.
#[async_trait]
pub trait WorkflowDefinition: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value>;
}

/// Per-instance capabilities handed to a workflow body.
pub struct WorkflowContext {
    workflow_id: String,
    runtime: Arc<WorkflowRuntime>,
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
    query_tx: watch::Sender<Value>,
    cancel: CancellationToken,
    store: Arc<dyn WorkflowStateRepository>,
    recovered_state: Option<Value>,
    recovered_deadline: Option<DateTime<Utc>>,
}

impl WorkflowContext {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Snapshot persisted before a restart, when this run is a recovery.
    pub fn recovered_state(&self) -> Option<&Value> {
        self.recovered_state.as_ref()
    }

    /// Timer deadline persisted before a restart.
    pub fn recovered_deadline(&self) -> Option<DateTime<Utc>> {
        self.recovered_deadline
    }

    /// Commit query state (and optionally a timer deadline) so queries
    /// and restart recovery observe it. Persistence failures are logged,
    /// not fatal: the instance keeps running on its in-memory state.
    pub async fn record_state(
        &self,
        state: Value,
        deadline: Option<DateTime<Utc>>,
    ) {
        self.query_tx.send_replace(state.clone());
        if let Err(e) = self
            .store
            .update_state(&self.workflow_id, &state, deadline)
            .await
        {
            warn!(
                workflow_id = %self.workflow_id,
                error = %e,
                "state snapshot failed"
            );
        }
    }

    /// Durable sleep. Returns `false` when cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Wait for the next signal, a deadline, or cancellation — whichever
    /// fires first.
    pub async fn signal_or_deadline(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> SignalOrDeadline {
        let remaining = deadline.map(|deadline| {
            (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
        });
        let mut signals = self.signals.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => SignalOrDeadline::Cancelled,
            _ = tokio::time::sleep(remaining.unwrap_or(Duration::ZERO)),
                if remaining.is_some() =>
            {
                SignalOrDeadline::DeadlineElapsed
            }
            signal = signals.recv() => match signal {
                Some(signal) => SignalOrDeadline::Signal(signal),
                None => SignalOrDeadline::Cancelled,
            },
        }
    }

    /// Execute a side-effecting step under the retry policy. Runs outside
    /// the replayable body from the runtime's perspective; activities are
    /// expected to be idempotent.
    pub async fn run_activity<T, F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut delay = policy.initial;
        for attempt in 1..=policy.attempts {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled(format!(
                    "activity {name} cancelled"
                )));
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt == policy.attempts => {
                    error!(
                        workflow_id = %self.workflow_id,
                        activity = name,
                        attempt,
                        error = %e,
                        "activity retries exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        workflow_id = %self.workflow_id,
                        activity = name,
                        attempt,
                        error = %e,
                        "activity failed, retrying"
                    );
                    if !self.sleep(delay).await {
                        return Err(CoreError::Cancelled(format!(
                            "activity {name} cancelled"
                        )));
                    }
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * policy.backoff)
                            .min(policy.max.as_secs_f64()),
                    );
                }
            }
        }
        Err(CoreError::Workflow(format!(
            "activity {name} configured with zero attempts"
        )))
    }

    /// Start a child workflow and await its result. Re-entrant on
    /// recovery: an already-started child is awaited, not restarted.
    pub async fn run_child(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<Value> {
        match self.runtime.start(workflow_type, workflow_id, input).await {
            Ok(_) => {}
            Err(CoreError::Conflict(_)) => {
                debug!(
                    parent = %self.workflow_id,
                    child = workflow_id,
                    "child workflow already started"
                );
            }
            Err(e) => return Err(e),
        }
        self.runtime.result(workflow_id).await
    }
}

#[derive(Debug, Clone)]
enum InstanceOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

struct Instance {
    signal_tx: mpsc::UnboundedSender<Signal>,
    query_rx: watch::Receiver<Value>,
    cancel: CancellationToken,
    result_rx: watch::Receiver<Option<InstanceOutcome>>,
}

/// Addressable handle over one instance.
#[derive(Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    runtime: Arc<WorkflowRuntime>,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", &self.workflow_id)
            .finish()
    }
}

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.workflow_id
    }

    pub async fn signal(&self, name: &str, args: Value) -> Result<()> {
        self.runtime.signal(&self.workflow_id, name, args).await
    }

    pub async fn query(&self, name: &str) -> Result<Value> {
        self.runtime.query(&self.workflow_id, name).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.runtime.cancel(&self.workflow_id).await
    }

    pub async fn result(&self) -> Result<Value> {
        self.runtime.result(&self.workflow_id).await
    }
}

pub struct WorkflowRuntime {
    definitions: RwLock<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    instances: Mutex<HashMap<String, Instance>>,
    store: Arc<dyn WorkflowStateRepository>,
}

impl WorkflowRuntime {
    pub fn new(store: Arc<dyn WorkflowStateRepository>) -> Arc<Self> {
        Arc::new(Self {
            definitions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            store,
        })
    }

    pub fn register(&self, definition: Arc<dyn WorkflowDefinition>) {
        self.definitions
            .write()
            .unwrap()
            .insert(definition.workflow_type().to_owned(), definition);
    }

    pub fn has_definition(&self, workflow_type: &str) -> bool {
        self.definitions.read().unwrap().contains_key(workflow_type)
    }

    pub fn running_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Start a new instance. An existing workflow id is an error.
    pub async fn start(
        self: &Arc<Self>,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowHandle> {
        let definition = self
            .definitions
            .read()
            .unwrap()
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| {
                CoreError::Workflow(format!(
                    "unknown workflow type: {workflow_type}"
                ))
            })?;

        let run = WorkflowRun {
            workflow_id: workflow_id.to_owned(),
            workflow_type: workflow_type.to_owned(),
            input: input.clone(),
            status: RunStatus::Running,
            state: Value::Object(Default::default()),
            result: None,
            deadline: None,
            created_at: Utc::now(),
        };
        if self.store.insert(&run).await? == InsertOutcome::Duplicate {
            return Err(CoreError::Conflict(format!(
                "workflow already exists: {workflow_id}"
            )));
        }

        info!(workflow_id, workflow_type, "workflow started");
        self.spawn_instance(definition, run, None, None);
        Ok(WorkflowHandle {
            workflow_id: workflow_id.to_owned(),
            runtime: self.clone(),
        })
    }

    /// Relaunch non-terminal instances from their persisted snapshots.
    /// Returns how many resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let running = self.store.list_running().await?;
        let mut resumed = 0usize;
        for run in running {
            if self
                .instances
                .lock()
                .unwrap()
                .contains_key(&run.workflow_id)
            {
                continue;
            }
            let Some(definition) = self
                .definitions
                .read()
                .unwrap()
                .get(&run.workflow_type)
                .cloned()
            else {
                warn!(
                    workflow_id = %run.workflow_id,
                    workflow_type = %run.workflow_type,
                    "cannot recover: definition not registered"
                );
                continue;
            };
            info!(
                workflow_id = %run.workflow_id,
                workflow_type = %run.workflow_type,
                "recovering workflow"
            );
            let state = run.state.clone();
            let deadline = run.deadline;
            self.spawn_instance(definition, run, Some(state), deadline);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn spawn_instance(
        self: &Arc<Self>,
        definition: Arc<dyn WorkflowDefinition>,
        run: WorkflowRun,
        recovered_state: Option<Value>,
        recovered_deadline: Option<DateTime<Utc>>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = watch::channel(
            recovered_state
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default())),
        );
        let (result_tx, result_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        self.instances.lock().unwrap().insert(run.workflow_id.clone(), {
            Instance {
                signal_tx,
                query_rx,
                cancel: cancel.clone(),
                result_rx,
            }
        });

        let ctx = WorkflowContext {
            workflow_id: run.workflow_id.clone(),
            runtime: self.clone(),
            signals: tokio::sync::Mutex::new(signal_rx),
            query_tx,
            cancel: cancel.clone(),
            store: self.store.clone(),
            recovered_state,
            recovered_deadline,
        };

        let runtime = self.clone();
        let store = self.store.clone();
        let workflow_id = run.workflow_id.clone();
        let input = run.input;
        tokio::spawn(async move {
            let outcome = match definition.run(ctx, input).await {
                Ok(_) if cancel.is_cancelled() => InstanceOutcome::Cancelled,
                Ok(value) => InstanceOutcome::Completed(value),
                Err(CoreError::Cancelled(_)) => InstanceOutcome::Cancelled,
                Err(e) => InstanceOutcome::Failed(e.to_string()),
            };

            let (status, result_value) = match &outcome {
                InstanceOutcome::Completed(value) => {
                    (RunStatus::Completed, Some(value.clone()))
                }
                InstanceOutcome::Failed(message) => (
                    RunStatus::Failed,
                    Some(Value::String(message.clone())),
                ),
                InstanceOutcome::Cancelled => (RunStatus::Cancelled, None),
            };
            if let Err(e) = store
                .finish(&workflow_id, status, result_value.as_ref())
                .await
            {
                error!(workflow_id, error = %e, "workflow finish persist failed");
            }

            // Publish the outcome before dropping the instance entry so
            // waiters holding a receiver observe it.
            let _ = result_tx.send(Some(outcome));
            runtime.instances.lock().unwrap().remove(&workflow_id);
            debug!(workflow_id, status = status.as_str(), "workflow finished");
        });
    }

    /// Deliver a signal. Terminal instances absorb signals silently;
    /// unknown ids fail.
    pub async fn signal(
        &self,
        workflow_id: &str,
        name: &str,
        args: Value,
    ) -> Result<()> {
        let sender = self
            .instances
            .lock()
            .unwrap()
            .get(workflow_id)
            .map(|instance| instance.signal_tx.clone());
        if let Some(sender) = sender {
            sender
                .send(Signal { name: name.to_owned(), args })
                .map_err(|_| {
                    CoreError::Workflow(format!(
                        "workflow {workflow_id} stopped accepting signals"
                    ))
                })?;
            return Ok(());
        }

        match self.store.get(workflow_id).await? {
            Some(run) if run.status.is_terminal() => {
                debug!(workflow_id, name, "signal to terminal workflow ignored");
                Ok(())
            }
            Some(_) => Err(CoreError::Workflow(format!(
                "workflow {workflow_id} is not resident in this process"
            ))),
            None => Err(CoreError::NotFound(format!(
                "workflow {workflow_id}"
            ))),
        }
    }

    /// Read committed query state. Works in every state, including after
    /// completion.
    pub async fn query(&self, workflow_id: &str, name: &str) -> Result<Value> {
        let state = {
            let instances = self.instances.lock().unwrap();
            instances
                .get(workflow_id)
                .map(|instance| instance.query_rx.borrow().clone())
        };
        let state = match state {
            Some(state) => state,
            None => self
                .store
                .get(workflow_id)
                .await?
                .ok_or_else(|| {
                    CoreError::NotFound(format!("workflow {workflow_id}"))
                })?
                .state,
        };
        Ok(state.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Request cooperative cancellation.
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let cancel = self
            .instances
            .lock()
            .unwrap()
            .get(workflow_id)
            .map(|instance| instance.cancel.clone());
        match cancel {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => match self.store.get(workflow_id).await? {
                Some(_) => Ok(()),
                None => Err(CoreError::NotFound(format!(
                    "workflow {workflow_id}"
                ))),
            },
        }
    }

    /// Await the instance result.
    pub async fn result(&self, workflow_id: &str) -> Result<Value> {
        let result_rx = self
            .instances
            .lock()
            .unwrap()
            .get(workflow_id)
            .map(|instance| instance.result_rx.clone());

        if let Some(mut result_rx) = result_rx {
            loop {
                let outcome = result_rx.borrow().clone();
                if let Some(outcome) = outcome {
                    return Self::outcome_to_result(workflow_id, outcome);
                }
                if result_rx.changed().await.is_err() {
                    break;
                }
            }
        }

        let run = self.store.get(workflow_id).await?.ok_or_else(|| {
            CoreError::NotFound(format!("workflow {workflow_id}"))
        })?;
        match run.status {
            RunStatus::Completed => Ok(run.result.unwrap_or(Value::Null)),
            RunStatus::Failed => Err(CoreError::Workflow(
                run.result
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "workflow failed".to_owned()),
            )),
            RunStatus::Cancelled => Err(CoreError::Cancelled(format!(
                "workflow {workflow_id} cancelled"
            ))),
            RunStatus::Running => Err(CoreError::Workflow(format!(
                "workflow {workflow_id} is not resident in this process"
            ))),
        }
    }

    fn outcome_to_result(
        workflow_id: &str,
        outcome: InstanceOutcome,
    ) -> Result<Value> {
        match outcome {
            InstanceOutcome::Completed(value) => Ok(value),
            InstanceOutcome::Failed(message) => {
                Err(CoreError::Workflow(message))
            }
            InstanceOutcome::Cancelled => Err(CoreError::Cancelled(format!(
                "workflow {workflow_id} cancelled"
            ))),
        }
    }
}
