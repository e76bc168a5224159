//! End-to-end dispatcher scenarios over the in-memory ports: ingestion,
//! classification, escalation, duplicate delivery, and poison pills.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use intake_core::Result;
use intake_core::classify::KeywordClassifier;
use intake_core::db::{
    EventRepository, InMemoryEventRepository, InMemoryIntentRepository,
    InMemoryRawMailRepository, InMemorySuggestionRepository,
};
use intake_core::dispatch::{Dispatcher, DispatcherSettings, Disposition};
use intake_core::mail::{MailPersistor, ParsedMail};
use intake_core::notify::MemoryNotifier;
use intake_core::storage::{BlobStorage, LocalDiskStore, MemoryTokenStore};
use intake_core::stream::{
    EVENT_PROCESSORS_GROUP, EventStream, InMemoryEventStream,
};
use intake_core::suggest::SuggestionService;
use intake_core::workflow::{
    ApprovalWorkflow, EscalationApprovalWorkflow,
    InMemoryWorkflowStateRepository, NoopOutcomeSink, WorkflowContext,
    WorkflowDefinition, WorkflowRuntime,
};
use intake_model::{
    EscalationRule, EventSource, EventStatus, EventType, HandlerBinding,
    IntentCatalogEntry, UnifiedEvent,
};

struct InquiryWorkflow;

#[async_trait]
impl WorkflowDefinition for InquiryWorkflow {
    fn workflow_type(&self) -> &'static str {
        "inquiry"
    }

    async fn run(&self, _ctx: WorkflowContext, input: Value) -> Result<Value> {
        Ok(json!({"handled": input["event_id"]}))
    }
}

fn inquiry_intent() -> IntentCatalogEntry {
    IntentCatalogEntry {
        name: "inquiry".into(),
        label: "Inquiry".into(),
        description: "Price and quotation requests".into(),
        exemplars: vec!["please quote".into()],
        keywords: vec!["rfq".into(), "quote".into(), "price".into()],
        priority: 10,
        active: true,
        handler: HandlerBinding::Workflow {
            name: "inquiry".into(),
            config: None,
        },
        escalation: Some(EscalationRule::AmountGt(10_000.0)),
        escalation_workflow: Some("escalation_approval".into()),
    }
}

struct Fixture {
    stream: Arc<InMemoryEventStream>,
    events: Arc<InMemoryEventRepository>,
    raw_mail: Arc<InMemoryRawMailRepository>,
    persistor: Arc<MailPersistor>,
    runtime: Arc<WorkflowRuntime>,
    dispatcher: Dispatcher,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let stream = Arc::new(InMemoryEventStream::new());
    let events = Arc::new(InMemoryEventRepository::new());
    let raw_mail = Arc::new(InMemoryRawMailRepository::new());
    let intents = Arc::new(InMemoryIntentRepository::with_entries(vec![
        inquiry_intent(),
        IntentCatalogEntry::fallback(),
    ]));
    let suggestions = Arc::new(SuggestionService::new(Arc::new(
        InMemorySuggestionRepository::new(),
    )));

    let storage = BlobStorage::new(
        None,
        Some(Arc::new(LocalDiskStore::new(
            dir.path().to_path_buf(),
            "http://localhost:8500".into(),
            Arc::new(MemoryTokenStore::new()),
        ))),
    );
    let persistor = Arc::new(MailPersistor::new(raw_mail.clone(), storage));

    let runtime = WorkflowRuntime::new(Arc::new(
        InMemoryWorkflowStateRepository::new(),
    ));
    let notifier = Arc::new(MemoryNotifier::new());
    runtime.register(Arc::new(InquiryWorkflow));
    runtime.register(Arc::new(ApprovalWorkflow::new(
        notifier.clone(),
        Arc::new(NoopOutcomeSink),
    )));
    runtime.register(Arc::new(EscalationApprovalWorkflow::new(
        events.clone(),
        "ops@intake.example".into(),
        24.0,
    )));

    let dispatcher = Dispatcher::new(
        stream.clone(),
        events.clone(),
        intents,
        suggestions,
        Arc::new(KeywordClassifier::new()),
        runtime.clone(),
        DispatcherSettings {
            group: EVENT_PROCESSORS_GROUP.to_owned(),
            consumer: "test-0".into(),
            batch_size: 10,
            block: Duration::from_millis(10),
            classifier_deadline: Duration::from_secs(5),
            suggest_threshold: 0.6,
            accept_threshold: 0.0,
        },
    );

    Fixture {
        stream,
        events,
        raw_mail,
        persistor,
        runtime,
        dispatcher,
        _dir: dir,
    }
}

fn rfq_mail(message_id: &str, body: &str) -> Vec<u8> {
    format!(
        "Message-ID: <{message_id}>\r\nFrom: Buyer <buyer@ex.com>\r\n\
To: sales@intake.example\r\nSubject: RFQ 100 units widget A\r\n\
Date: Fri, 14 Mar 2025 09:26:53 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}

/// Persist + enqueue a mail the way the IMAP source does, then return
/// the appended event.
async fn enqueue_mail(
    fx: &Fixture,
    message_id: &str,
    body: &str,
) -> UnifiedEvent {
    let mail = ParsedMail::parse(&rfq_mail(message_id, body)).unwrap();
    let record = fx.persistor.persist(&mail, Some(1)).await.unwrap();

    let mut event = UnifiedEvent::new(
        EventType::Email,
        EventSource::Email,
        format!("email:{}", mail.message_id),
        mail.text_content(),
        mail.date.unwrap(),
    );
    event.source_id = Some(mail.message_id.clone());
    event.user_external_id = Some(mail.sender.clone());
    event.metadata.insert("subject".into(), mail.subject.clone());
    event
        .metadata
        .insert("email_raw_id".into(), record.id.to_string());

    fx.stream.append(&event).await.unwrap();
    fx.persistor.mark_processed(record.id, event.event_id).await.unwrap();
    event
}

async fn read_one(fx: &Fixture) -> intake_core::stream::StreamEntry {
    fx.stream.create_group(EVENT_PROCESSORS_GROUP, "0").await.unwrap();
    let mut entries = fx
        .stream
        .read(EVENT_PROCESSORS_GROUP, "test-0", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    entries.remove(0)
}

#[tokio::test]
async fn s1_new_inquiry_below_escalation_threshold() {
    let fx = fixture();
    let event = enqueue_mail(
        &fx,
        "rfq-1@ex.com",
        "Please quote 100 pcs. Target price 50 USD.",
    )
    .await;

    let entry = read_one(&fx).await;
    let disposition = fx.dispatcher.process_entry(&entry).await;

    // Tokens [100, 50], max 100, 100 > 10000 is false: the handler
    // workflow runs, not the escalation workflow.
    let expected_workflow = format!("inquiry-{}", event.event_id);
    assert_eq!(disposition, Disposition::Completed {
        intent: "inquiry".into(),
        workflow_id: Some(expected_workflow.clone()),
    });

    assert_eq!(fx.raw_mail.mail_count(), 1);
    let row = fx.events.get(event.event_id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.intent.as_deref(), Some("inquiry"));
    assert_eq!(row.workflow_id.as_deref(), Some(expected_workflow.as_str()));
    assert_eq!(
        row.idempotency_key,
        "email:<rfq-1@ex.com>".to_owned()
    );

    // The handler workflow actually ran.
    let result = fx.runtime.result(&expected_workflow).await.unwrap();
    assert_eq!(result["handled"], json!(event.event_id));
}

#[tokio::test]
async fn s2_escalation_by_amount() {
    let fx = fixture();
    let event =
        enqueue_mail(&fx, "rfq-2@ex.com", "Target price 50000 USD total.")
            .await;

    let entry = read_one(&fx).await;
    let disposition = fx.dispatcher.process_entry(&entry).await;

    // max(50000) > 10000: the escalation workflow owns the event.
    let expected_workflow =
        format!("escalation_approval-{}", event.event_id);
    assert_eq!(disposition, Disposition::Completed {
        intent: "inquiry".into(),
        workflow_id: Some(expected_workflow.clone()),
    });

    let row = fx.events.get(event.event_id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.workflow_id.as_deref(), Some(expected_workflow.as_str()));
}

#[tokio::test]
async fn s3_duplicate_delivery_is_absorbed() {
    let fx = fixture();
    let event = enqueue_mail(
        &fx,
        "rfq-1@ex.com",
        "Please quote 100 pcs. Target price 50 USD.",
    )
    .await;

    let entry = read_one(&fx).await;
    let first = fx.dispatcher.process_entry(&entry).await;
    assert!(matches!(first, Disposition::Completed { .. }));

    // The broker re-delivers the same entry after a consumer crash.
    fx.stream.requeue(EVENT_PROCESSORS_GROUP, &entry.id);
    let replay = fx
        .stream
        .read(EVENT_PROCESSORS_GROUP, "test-0", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(replay.len(), 1);
    let second = fx.dispatcher.process_entry(&replay[0]).await;
    assert_eq!(second, Disposition::Duplicate);

    // Exactly one event row, both deliveries acked, one workflow start.
    assert_eq!(
        fx.events
            .find_by_idempotency_key("email:<rfq-1@ex.com>")
            .await
            .unwrap()
            .map(|row| row.id),
        Some(event.event_id)
    );
    assert_eq!(fx.stream.ack_count(EVENT_PROCESSORS_GROUP), 2);
    assert_eq!(
        fx.stream
            .group_info(EVENT_PROCESSORS_GROUP)
            .await
            .unwrap()
            .pending,
        0
    );
    assert!(
        fx.runtime
            .result(&format!("inquiry-{}", event.event_id))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn s6_poison_pill_is_acked_and_isolated() {
    let fx = fixture();
    fx.stream.create_group(EVENT_PROCESSORS_GROUP, "0").await.unwrap();

    // Payload with no event_id.
    fx.stream
        .append_fields(vec![
            ("content".into(), "garbage".into()),
            ("source".into(), "email".into()),
        ])
        .await
        .unwrap();

    let entries = fx
        .stream
        .read(EVENT_PROCESSORS_GROUP, "test-0", 10, Duration::ZERO)
        .await
        .unwrap();
    let disposition = fx.dispatcher.process_entry(&entries[0]).await;
    assert_eq!(disposition, Disposition::Poison);

    // Acked, so the group's pending count does not grow.
    assert_eq!(
        fx.stream
            .group_info(EVENT_PROCESSORS_GROUP)
            .await
            .unwrap()
            .pending,
        0
    );
    assert_eq!(
        fx.events
            .count_by_status(EventStatus::Pending)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn idempotent_ingestion_property() {
    // Delivering the same event k times yields one row and one workflow.
    let fx = fixture();
    let mut event = UnifiedEvent::new(
        EventType::Email,
        EventSource::Email,
        "email:<prop-1@ex.com>",
        "please quote 5 pcs",
        Utc::now(),
    );
    event.metadata.insert("subject".into(), "quote request".into());

    fx.stream.create_group(EVENT_PROCESSORS_GROUP, "0").await.unwrap();
    for _ in 0..4 {
        fx.stream.append(&event).await.unwrap();
    }

    let entries = fx
        .stream
        .read(EVENT_PROCESSORS_GROUP, "test-0", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(entries.len(), 4);
    let mut completed = 0;
    let mut duplicates = 0;
    for entry in &entries {
        match fx.dispatcher.process_entry(entry).await {
            Disposition::Completed { .. } => completed += 1,
            Disposition::Duplicate => duplicates += 1,
            other => panic!("unexpected disposition: {other:?}"),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(duplicates, 3);
    assert_eq!(fx.stream.ack_count(EVENT_PROCESSORS_GROUP), 4);

    let row = fx
        .events
        .find_by_idempotency_key("email:<prop-1@ex.com>")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, EventStatus::Completed);
}

#[tokio::test]
async fn unknown_handler_workflow_fails_the_event_but_acks() {
    let fx = fixture();
    let intents = InMemoryIntentRepository::with_entries(vec![
        IntentCatalogEntry {
            handler: HandlerBinding::Workflow {
                name: "not_registered".into(),
                config: None,
            },
            escalation: None,
            escalation_workflow: None,
            ..inquiry_intent()
        },
        IntentCatalogEntry::fallback(),
    ]);
    let dispatcher = Dispatcher::new(
        fx.stream.clone(),
        fx.events.clone(),
        Arc::new(intents),
        Arc::new(SuggestionService::new(Arc::new(
            InMemorySuggestionRepository::new(),
        ))),
        Arc::new(KeywordClassifier::new()),
        fx.runtime.clone(),
        DispatcherSettings {
            group: EVENT_PROCESSORS_GROUP.to_owned(),
            consumer: "test-1".into(),
            batch_size: 10,
            block: Duration::from_millis(10),
            classifier_deadline: Duration::from_secs(5),
            suggest_threshold: 0.6,
            accept_threshold: 0.0,
        },
    );

    let event = UnifiedEvent::new(
        EventType::Email,
        EventSource::Email,
        format!("email:<fail-{}>", Uuid::new_v4()),
        "please quote 7 pcs",
        Utc::now(),
    );
    fx.stream.create_group(EVENT_PROCESSORS_GROUP, "0").await.unwrap();
    fx.stream.append(&event).await.unwrap();

    let entries = fx
        .stream
        .read(EVENT_PROCESSORS_GROUP, "test-1", 10, Duration::ZERO)
        .await
        .unwrap();
    let disposition = dispatcher.process_entry(&entries[0]).await;
    assert!(matches!(disposition, Disposition::Failed { .. }));

    let row = fx.events.get(event.event_id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Failed);
    assert!(row.error_message.unwrap().contains("unknown workflow type"));
    // Failed events are still acked; operators replay via the admin
    // surface.
    assert_eq!(
        fx.stream
            .group_info(EVENT_PROCESSORS_GROUP)
            .await
            .unwrap()
            .pending,
        0
    );
}
