//! Dispatcher: pulls events off the stream, enforces idempotency,
//! classifies, evaluates escalation, and hands events to their handler
//! workflows.
//!
//! Every stream entry ends in exactly one acknowledgement regardless of
//! outcome; the catch-all failure rule is a terminal match arm, never an
//! unwound exception. Multiple consumers with distinct names may run in
//! the same group; the event row's idempotency-key constraint serializes
//! by key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use intake_model::{
    EventRow, FALLBACK_INTENT, HandlerBinding, IntentCatalogEntry,
    SuggestionPayload, UnifiedEvent, wire,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{Classifier, classify_with_deadline};
use crate::db::{EventRepository, InsertOutcome, IntentRepository};
use crate::error::Result;
use crate::stream::{EventStream, StreamEntry};
use crate::suggest::SuggestionService;
use crate::workflow::{HandlerInput, WorkflowRuntime};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub group: String,
    /// Stable consumer name within the group.
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub classifier_deadline: Duration,
    /// Minimum confidence before a proposed new intent becomes a pending
    /// suggestion.
    pub suggest_threshold: f64,
    /// Minimum confidence before an existing match is accepted.
    pub accept_threshold: f64,
}

/// How one entry resolved. Test observability; the stream effect is the
/// same (one ack) either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Uninterpretable payload; acked and logged.
    Poison,
    /// Another delivery already owns this idempotency key.
    Duplicate,
    Completed { intent: String, workflow_id: Option<String> },
    Failed { error: String },
}

pub struct Dispatcher {
    stream: Arc<dyn EventStream>,
    events: Arc<dyn EventRepository>,
    intents: Arc<dyn IntentRepository>,
    suggestions: Arc<SuggestionService>,
    classifier: Arc<dyn Classifier>,
    runtime: Arc<WorkflowRuntime>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        stream: Arc<dyn EventStream>,
        events: Arc<dyn EventRepository>,
        intents: Arc<dyn IntentRepository>,
        suggestions: Arc<SuggestionService>,
        classifier: Arc<dyn Classifier>,
        runtime: Arc<WorkflowRuntime>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            stream,
            events,
            intents,
            suggestions,
            classifier,
            runtime,
            settings,
        }
    }

    /// Consumer loop. Honors the shutdown token at the read boundary.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.stream.create_group(&self.settings.group, "0").await?;

        // Entries delivered to a previous incarnation of this consumer
        // but never acked come first.
        match self
            .stream
            .read_pending(
                &self.settings.group,
                &self.settings.consumer,
                self.settings.batch_size,
            )
            .await
        {
            Ok(pending) => {
                for entry in pending {
                    self.process_entry(&entry).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "pending-entry scan failed, continuing");
            }
        }

        info!(
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "dispatcher consumer running"
        );
        loop {
            let entries = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.stream.read(
                    &self.settings.group,
                    &self.settings.consumer,
                    self.settings.batch_size,
                    self.settings.block,
                ) => match read {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(error = %e, "stream read failed, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                },
            };
            for entry in entries {
                self.process_entry(&entry).await;
            }
        }
        info!(consumer = %self.settings.consumer, "dispatcher consumer stopped");
        Ok(())
    }

    /// Process one delivered entry. Never propagates: every path ends in
    /// an ack.
    pub async fn process_entry(&self, entry: &StreamEntry) -> Disposition {
        let disposition = match wire::decode(&entry.fields) {
            Err(e) => {
                // Poison-pill isolation: ack so the stream advances.
                error!(
                    stream_id = %entry.id,
                    error = %e,
                    "uninterpretable stream payload"
                );
                Disposition::Poison
            }
            Ok(event) => match self.handle_event(&event).await {
                Ok(disposition) => disposition,
                Err(e) => {
                    let message = e.to_string();
                    error!(
                        event_id = %event.event_id,
                        error = %message,
                        "event processing failed"
                    );
                    if let Err(mark_err) = self
                        .events
                        .mark_failed(event.event_id, &message, Utc::now())
                        .await
                    {
                        error!(
                            event_id = %event.event_id,
                            error = %mark_err,
                            "failed-status write lost"
                        );
                    }
                    Disposition::Failed { error: message }
                }
            },
        };

        // Exactly one ack per processed entry, success or not. A
        // redelivery of this entry would land on the idempotency branch.
        if let Err(e) = self.stream.ack(&self.settings.group, &entry.id).await
        {
            error!(stream_id = %entry.id, error = %e, "ack failed");
        }
        disposition
    }

    async fn handle_event(
        &self,
        event: &UnifiedEvent,
    ) -> Result<Disposition> {
        // Idempotency check: the key may already be owned.
        if self
            .events
            .find_by_idempotency_key(&event.idempotency_key)
            .await?
            .is_some()
        {
            debug!(
                idempotency_key = %event.idempotency_key,
                "duplicate delivery absorbed"
            );
            return Ok(Disposition::Duplicate);
        }

        let row = EventRow::from_event(event, Utc::now());
        if self.events.insert_pending(&row).await? == InsertOutcome::Duplicate
        {
            // Unique-key race with a sibling consumer; same absorption.
            return Ok(Disposition::Duplicate);
        }
        self.events.mark_processing(row.id, Utc::now()).await?;

        let mut catalog = self.intents.list_active().await?;
        if !catalog.iter().any(IntentCatalogEntry::is_fallback) {
            catalog.push(IntentCatalogEntry::fallback());
        }
        let pending = match self.suggestions.pending_intent_names().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "pending-suggestion scan failed");
                Vec::new()
            }
        };

        let outcome = classify_with_deadline(
            self.classifier.as_ref(),
            self.settings.classifier_deadline,
            event,
            &catalog,
            &pending,
        )
        .await;

        let matched = outcome
            .matched_intent
            .clone()
            .filter(|_| outcome.confidence >= self.settings.accept_threshold)
            .filter(|name| catalog.iter().any(|entry| entry.name == *name));

        if let Some(proposal) = &outcome.new_suggestion
            && matched.is_none()
            && outcome.confidence >= self.settings.suggest_threshold
        {
            let payload = SuggestionPayload::NewIntent {
                name: proposal.name.clone(),
                label: proposal.label.clone(),
                description: proposal.description.clone(),
                handler: proposal.handler_hint.clone(),
            };
            match self
                .suggestions
                .create(payload, Some(event.event_id))
                .await
            {
                Ok(id) => {
                    info!(
                        suggestion_id = %id,
                        name = %proposal.name,
                        "new intent proposed"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "new-intent suggestion not recorded");
                }
            }
        }

        let intent =
            matched.unwrap_or_else(|| FALLBACK_INTENT.to_owned());
        self.events
            .record_classification(
                row.id,
                &intent,
                outcome.confidence,
                &outcome.reasoning,
            )
            .await?;

        let entry = catalog
            .iter()
            .find(|entry| entry.name == intent)
            .cloned()
            .unwrap_or_else(IntentCatalogEntry::fallback);

        let escalated = entry
            .escalation
            .as_ref()
            .is_some_and(|rule| rule.fires(&event.content));

        let escalation_target = if escalated {
            entry.escalation_workflow.as_deref()
        } else {
            None
        };
        let workflow_id = if let Some(workflow_type) = escalation_target {
            Some(self.start_handler(workflow_type, event, &intent).await?)
        } else {
            match &entry.handler {
                HandlerBinding::Workflow { name, .. } => {
                    Some(self.start_handler(name, event, &intent).await?)
                }
                // An external agent runner may attach later by event id;
                // the core is done.
                HandlerBinding::Agent { .. } => None,
            }
        };

        self.events
            .mark_completed(row.id, workflow_id.as_deref(), Utc::now())
            .await?;
        info!(
            event_id = %event.event_id,
            intent = %intent,
            workflow_id = workflow_id.as_deref().unwrap_or("-"),
            escalated,
            "event dispatched"
        );
        Ok(Disposition::Completed { intent, workflow_id })
    }

    /// Start a handler workflow; the event row is handed off to it.
    async fn start_handler(
        &self,
        workflow_type: &str,
        event: &UnifiedEvent,
        intent: &str,
    ) -> Result<String> {
        let workflow_id = format!("{workflow_type}-{}", event.event_id);
        let input =
            serde_json::to_value(HandlerInput::from_event(event, intent))?;
        self.runtime
            .start(workflow_type, &workflow_id, input)
            .await?;
        Ok(workflow_id)
    }
}
