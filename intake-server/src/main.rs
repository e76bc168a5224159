//! # Intake Server
//!
//! Daemon binary for the Intake event ingestion platform.
//!
//! ## Overview
//!
//! On startup the server connects PostgreSQL and the broker, runs
//! migrations, wires the engine components, recovers non-terminal
//! workflows, launches one IMAP poll loop per active mail account plus
//! the configured number of dispatcher consumers, and exposes a small
//! HTTP surface:
//!
//! - **Health**: liveness plus database/broker probes
//! - **Status**: stream length, consumer-group pending counts, failed
//!   events, pending suggestions, worker states
//! - **Webhook ingestion**: inbound webhooks normalized onto the stream
//! - **Local blobs**: serves signed URLs minted by the local-disk store

mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use intake_core::classify::{Classifier, HttpClassifier, KeywordClassifier};
use intake_core::db::{
    AccountRepository, PostgresAccountRepository, PostgresEventRepository,
    PostgresIntentRepository, PostgresRawMailRepository,
    PostgresSuggestionRepository,
};
use intake_core::dispatch::{Dispatcher, DispatcherSettings};
use intake_core::mail::{ImapFetcher, ImapMailFetch, MailPersistor};
use intake_core::notify::{NoopNotifier, Notifier, SmtpNotifier};
use intake_core::storage::{
    BlobStorage, LocalDiskStore, RedisTokenStore, RemoteObjectStore,
};
use intake_core::stream::{
    EVENTS_STREAM, EVENT_PROCESSORS_GROUP, RedisCheckpointStore,
    RedisEventStream, RedisLock,
};
use intake_core::suggest::{SuggestionOutcomeSink, SuggestionService};
use intake_core::workers::{Supervisor, imap_account_loop};
use intake_core::workflow::{
    ApprovalWorkflow, EscalationApprovalWorkflow, ManualReviewWorkflow,
    PostgresWorkflowStateRepository, WorkflowRuntime,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::AppState;

fn consumer_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| "intake".to_owned());
    format!("{host}-{}", std::process::id())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = intake_config::load().context("configuration")?;
    info!(
        http = %format!("{}:{}", config.http.host, config.http.port),
        "starting intake server"
    );

    // Shared stores.
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("postgres connection")?;
    sqlx::migrate!().run(&pool).await.context("migrations")?;

    let redis_client = redis::Client::open(config.redis.url.as_str())
        .context("broker client")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("broker connection")?;
    info!("connected to postgres and the broker");

    // Repositories.
    let events = Arc::new(PostgresEventRepository::new(pool.clone()));
    let raw_mail = Arc::new(PostgresRawMailRepository::new(pool.clone()));
    let intents = Arc::new(PostgresIntentRepository::new(pool.clone()));
    let suggestions_repo =
        Arc::new(PostgresSuggestionRepository::new(pool.clone()));
    let accounts = Arc::new(PostgresAccountRepository::new(pool.clone()));

    // Blob storage: remote first, local-disk fallback.
    let remote = match &config.remote_store {
        Some(remote_config) => Some(Arc::new(
            RemoteObjectStore::new(remote_config.clone())
                .context("remote object store")?,
        )),
        None => {
            info!("no remote object store configured, local-disk only");
            None
        }
    };
    let local = if config.local_storage.enabled {
        Some(Arc::new(LocalDiskStore::new(
            config.local_storage.path.clone(),
            config.local_storage.public_url.clone(),
            Arc::new(RedisTokenStore::new(redis_conn.clone())),
        )))
    } else {
        None
    };
    anyhow::ensure!(
        remote.is_some() || local.is_some(),
        "no storage backend configured"
    );
    let storage = BlobStorage::new(remote, local.clone());

    // Notification surface.
    let notifier: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => {
            Arc::new(SmtpNotifier::new(smtp).context("smtp notifier")?)
        }
        None => {
            warn!("no SMTP relay configured, notifications are dropped");
            Arc::new(NoopNotifier)
        }
    };

    // Workflow runtime and built-in definitions.
    let workflow_store =
        Arc::new(PostgresWorkflowStateRepository::new(pool.clone()));
    let runtime = WorkflowRuntime::new(workflow_store);
    let suggestions = Arc::new(SuggestionService::with_runtime(
        suggestions_repo.clone(),
        runtime.clone(),
    ));
    let operators = config
        .approvals
        .approver
        .clone()
        .unwrap_or_default();
    runtime.register(Arc::new(ApprovalWorkflow::new(
        notifier.clone(),
        Arc::new(SuggestionOutcomeSink::new(suggestions.clone())),
    )));
    runtime.register(Arc::new(EscalationApprovalWorkflow::new(
        events.clone(),
        operators.clone(),
        config.approvals.timeout_hours,
    )));
    runtime.register(Arc::new(ManualReviewWorkflow::new(
        notifier.clone(),
        operators,
    )));
    let recovered = runtime.recover().await.context("workflow recovery")?;
    if recovered > 0 {
        info!(recovered, "resumed non-terminal workflows");
    }

    // Event stream and classifier.
    let stream =
        Arc::new(RedisEventStream::new(redis_conn.clone(), EVENTS_STREAM));
    let classifier: Arc<dyn Classifier> = match &config.classifier.endpoint {
        Some(endpoint) => Arc::new(
            HttpClassifier::new(endpoint.clone())
                .context("http classifier")?,
        ),
        None => Arc::new(KeywordClassifier::new()),
    };

    // Workers.
    let identity = consumer_identity();
    let supervisor = Arc::new(Supervisor::new());

    let persistor =
        Arc::new(MailPersistor::new(raw_mail.clone(), storage.clone()));
    let fetcher = Arc::new(ImapFetcher::new(
        Arc::new(ImapMailFetch::new()),
        persistor.clone(),
        stream.clone(),
        Arc::new(RedisLock::new(redis_conn.clone())),
        Arc::new(RedisCheckpointStore::new(redis_conn.clone())),
        identity.clone(),
        config.imap.poll_interval,
        config.imap.lock_margin,
    ));

    let mut imap_accounts = accounts
        .list_active_imap()
        .await
        .context("account listing")?;
    if imap_accounts.is_empty()
        && let Some(env_account) = &config.imap.env_account
    {
        info!("no database mail accounts, using the environment account");
        imap_accounts.push(env_account.clone());
    }
    info!(accounts = imap_accounts.len(), "starting imap workers");
    for account in imap_accounts {
        let fetcher = fetcher.clone();
        let cancel = supervisor.cancel_token();
        let name = format!("imap:{}", account.worker_key());
        supervisor.spawn(&name, move || {
            imap_account_loop(fetcher.clone(), account.clone(), cancel.clone())
        });
    }

    for slot in 0..config.dispatcher.consumers.max(1) {
        let dispatcher = Arc::new(Dispatcher::new(
            stream.clone(),
            events.clone(),
            intents.clone(),
            suggestions.clone(),
            classifier.clone(),
            runtime.clone(),
            DispatcherSettings {
                group: EVENT_PROCESSORS_GROUP.to_owned(),
                consumer: format!("{identity}-{slot}"),
                batch_size: config.dispatcher.batch_size,
                block: config.dispatcher.block,
                classifier_deadline: config.classifier.deadline,
                suggest_threshold: config.classifier.suggest_threshold,
                accept_threshold: config.classifier.accept_threshold,
            },
        ));
        let cancel = supervisor.cancel_token();
        supervisor.spawn(&format!("dispatcher:{slot}"), move || {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            async move { dispatcher.run(cancel).await }
        });
    }

    // HTTP surface.
    let app_state = Arc::new(AppState {
        pool: pool.clone(),
        redis: redis_conn,
        stream,
        events,
        persistor,
        suggestions_repo,
        supervisor: supervisor.clone(),
        local_store: local,
    });
    let router = routes::router(app_state);

    let bind = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "http surface listening");

    let shutdown_supervisor = supervisor.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
        })
        .await
        .context("http server")?;

    shutdown_supervisor.shutdown(Duration::from_secs(20)).await;
    pool.close().await;
    info!("intake server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
