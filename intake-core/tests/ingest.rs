//! Ingestion-path scenarios beyond the mail happy path: agent-handled
//! events, classifier failure fallback, new-intent proposals, and the
//! attachment-authority rule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use intake_core::Result;
use intake_core::classify::{
    ClassificationOutcome, Classifier, NewIntentProposal,
};
use intake_core::db::{
    EventRepository, InMemoryEventRepository, InMemoryIntentRepository,
    InMemoryRawMailRepository, InMemorySuggestionRepository,
    RawMailRepository, SuggestionRepository,
};
use intake_core::dispatch::{Dispatcher, DispatcherSettings, Disposition};
use intake_core::mail::{MailPersistor, ParsedMail};
use intake_core::storage::{BlobStorage, LocalDiskStore, MemoryTokenStore};
use intake_core::stream::{
    EVENT_PROCESSORS_GROUP, EventStream, InMemoryEventStream,
};
use intake_core::suggest::SuggestionService;
use intake_core::workflow::{
    InMemoryWorkflowStateRepository, WorkflowRuntime,
};
use intake_model::{
    EventSource, EventStatus, EventType, HandlerBinding,
    IntentCatalogEntry, SuggestionKind, SuggestionStatus, UnifiedEvent,
};

/// Classifier scripted per test.
struct ScriptedClassifier {
    outcome: ClassificationOutcome,
    fail: bool,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _event: &UnifiedEvent,
        _catalog: &[IntentCatalogEntry],
        _pending: &[String],
    ) -> Result<ClassificationOutcome> {
        if self.fail {
            return Err(intake_core::CoreError::Classifier(
                "upstream 503".into(),
            ));
        }
        Ok(self.outcome.clone())
    }
}

fn settings(consumer: &str) -> DispatcherSettings {
    DispatcherSettings {
        group: EVENT_PROCESSORS_GROUP.to_owned(),
        consumer: consumer.to_owned(),
        batch_size: 10,
        block: Duration::from_millis(10),
        classifier_deadline: Duration::from_secs(5),
        suggest_threshold: 0.6,
        accept_threshold: 0.0,
    }
}

fn agent_intent(name: &str) -> IntentCatalogEntry {
    IntentCatalogEntry {
        name: name.into(),
        label: name.into(),
        description: String::new(),
        exemplars: Vec::new(),
        keywords: Vec::new(),
        priority: 5,
        active: true,
        handler: HandlerBinding::Agent { config: None },
        escalation: None,
        escalation_workflow: None,
    }
}

struct Rig {
    stream: Arc<InMemoryEventStream>,
    events: Arc<InMemoryEventRepository>,
    suggestions_repo: Arc<InMemorySuggestionRepository>,
    dispatcher: Dispatcher,
}

fn rig(classifier: ScriptedClassifier) -> Rig {
    let stream = Arc::new(InMemoryEventStream::new());
    let events = Arc::new(InMemoryEventRepository::new());
    let suggestions_repo = Arc::new(InMemorySuggestionRepository::new());
    let runtime = WorkflowRuntime::new(Arc::new(
        InMemoryWorkflowStateRepository::new(),
    ));
    let dispatcher = Dispatcher::new(
        stream.clone(),
        events.clone(),
        Arc::new(InMemoryIntentRepository::with_entries(vec![
            agent_intent("order"),
            IntentCatalogEntry::fallback(),
        ])),
        Arc::new(SuggestionService::new(suggestions_repo.clone())),
        Arc::new(classifier),
        runtime,
        settings("rig-0"),
    );
    Rig { stream, events, suggestions_repo, dispatcher }
}

async fn push_and_process(
    rig: &Rig,
    event: &UnifiedEvent,
) -> Disposition {
    rig.stream.create_group(EVENT_PROCESSORS_GROUP, "0").await.unwrap();
    rig.stream.append(event).await.unwrap();
    let entries = rig
        .stream
        .read(EVENT_PROCESSORS_GROUP, "rig-0", 10, Duration::ZERO)
        .await
        .unwrap();
    rig.dispatcher.process_entry(&entries[0]).await
}

fn webhook_event(content: &str) -> UnifiedEvent {
    let mut event = UnifiedEvent::new(
        EventType::Webhook,
        EventSource::Webhook,
        format!("webhook:crm:{}", Uuid::new_v4()),
        content,
        Utc::now(),
    );
    event.metadata.insert("webhook_source".into(), "crm".into());
    event
}

#[tokio::test]
async fn agent_handled_event_completes_without_workflow() {
    let rig = rig(ScriptedClassifier {
        outcome: ClassificationOutcome {
            matched_intent: Some("order".into()),
            confidence: 0.9,
            reasoning: "scripted".into(),
            new_suggestion: None,
        },
        fail: false,
    });

    let event = webhook_event("order #42 please");
    let disposition = push_and_process(&rig, &event).await;
    assert_eq!(disposition, Disposition::Completed {
        intent: "order".into(),
        workflow_id: None,
    });

    let row = rig.events.get(event.event_id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.workflow_id, None);
    assert_eq!(row.confidence, Some(0.9));
}

#[tokio::test]
async fn classifier_failure_falls_back_to_other() {
    let rig = rig(ScriptedClassifier {
        outcome: ClassificationOutcome {
            matched_intent: None,
            confidence: 0.0,
            reasoning: String::new(),
            new_suggestion: None,
        },
        fail: true,
    });

    let event = webhook_event("anything at all");
    let disposition = push_and_process(&rig, &event).await;
    assert_eq!(disposition, Disposition::Completed {
        intent: "other".into(),
        workflow_id: None,
    });

    // The event still completes; the substitute outcome is recorded.
    let row = rig.events.get(event.event_id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.intent.as_deref(), Some("other"));
    assert_eq!(row.confidence, Some(0.0));
    assert!(row.reasoning.unwrap().starts_with("classifier_failed:"));
}

#[tokio::test]
async fn confident_proposal_becomes_a_pending_suggestion() {
    let proposal = NewIntentProposal {
        name: "logistics".into(),
        label: "Logistics".into(),
        description: "Shipping and customs questions".into(),
        handler_hint: HandlerBinding::Agent { config: None },
    };
    let rig = rig(ScriptedClassifier {
        outcome: ClassificationOutcome {
            matched_intent: None,
            confidence: 0.8,
            reasoning: "novel topic".into(),
            new_suggestion: Some(proposal),
        },
        fail: false,
    });

    let event = webhook_event("when does the container ship?");
    let disposition = push_and_process(&rig, &event).await;

    // The event continues under the fallback intent.
    assert_eq!(disposition, Disposition::Completed {
        intent: "other".into(),
        workflow_id: None,
    });

    let pending = rig
        .suggestions_repo
        .list(
            Some(SuggestionKind::NewIntent),
            Some(SuggestionStatus::Pending),
            0,
            10,
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].natural_key, "logistics");
    assert_eq!(pending[0].source_event_id, Some(event.event_id));
}

#[tokio::test]
async fn low_confidence_proposal_is_not_recorded() {
    let proposal = NewIntentProposal {
        name: "logistics".into(),
        label: "Logistics".into(),
        description: String::new(),
        handler_hint: HandlerBinding::Agent { config: None },
    };
    let rig = rig(ScriptedClassifier {
        outcome: ClassificationOutcome {
            matched_intent: None,
            confidence: 0.4,
            reasoning: "weak hunch".into(),
            new_suggestion: Some(proposal),
        },
        fail: false,
    });

    let event = webhook_event("maybe shipping related");
    push_and_process(&rig, &event).await;

    assert_eq!(rig.suggestions_repo.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn attachment_rows_are_authoritative_by_event_id() {
    // The stream payload may carry attachment metadata, but consumers
    // must resolve attachments through the table keyed by event id.
    let dir = tempfile::tempdir().unwrap();
    let raw_mail = Arc::new(InMemoryRawMailRepository::new());
    let storage = BlobStorage::new(
        None,
        Some(Arc::new(LocalDiskStore::new(
            dir.path().to_path_buf(),
            "http://localhost:8500".into(),
            Arc::new(MemoryTokenStore::new()),
        ))),
    );
    let persistor = Arc::new(MailPersistor::new(raw_mail.clone(), storage));

    let raw = b"Message-ID: <att-1@ex.com>\r\nFrom: a@b.c\r\n\
To: inbox@intake.example\r\nSubject: files\r\n\
MIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"bb\"\r\n\r\n\
--bb\r\nContent-Type: text/plain\r\n\r\nsee files\r\n\
--bb\r\nContent-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\r\nJVBERi0xLjQK\r\n--bb--\r\n";
    let mail = ParsedMail::parse(raw).unwrap();
    let record = persistor.persist(&mail, None).await.unwrap();

    let event_id = Uuid::new_v4();
    persistor.mark_processed(record.id, event_id).await.unwrap();

    let attachments =
        raw_mail.attachments_for_event(event_id).await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].filename, "a.pdf");
    assert!(!attachments[0].is_signature);

    // An unrelated event id resolves to nothing.
    assert!(
        raw_mail
            .attachments_for_event(Uuid::new_v4())
            .await
            .unwrap()
            .is_empty()
    );
}
