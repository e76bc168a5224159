//! HTTP surface: health, operator status, webhook ingestion, local-blob
//! serving, attachment URLs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use intake_core::CoreError;
use intake_core::db::{EventRepository, SuggestionRepository};
use intake_core::stream::EventStream;
use intake_model::{
    EventSource, EventStatus, EventType, Priority, UnifiedEvent,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::state::AppState;

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";
const ATTACHMENT_URL_TTL: Duration = Duration::from_secs(600);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status/stream", get(stream_status))
        .route("/status/workers", get(worker_status))
        .route("/ingest/webhook/{source}", post(ingest_webhook))
        .route("/storage/local/{*key}", get(serve_local_blob))
        .route("/attachments/{id}/url", get(attachment_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, axum::Json(json!({"error": self.1}))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(what) => {
                ApiError(StatusCode::NOT_FOUND, what)
            }
            CoreError::Conflict(what) => {
                ApiError(StatusCode::CONFLICT, what)
            }
            other => {
                error!(error = %other, "request failed");
                ApiError(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_owned(),
                )
            }
        }
    }
}

async fn health(
    State(state): State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();
    let mut conn = state.redis.clone();
    let broker_ok = redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .is_ok();

    axum::Json(json!({
        "status": if db_ok && broker_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "broker": broker_ok,
    }))
}

/// The three operator counters: failed events, pending suggestions, and
/// consumer-group pending entries.
async fn stream_status(
    State(state): State<Arc<AppState>>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    let stream_info = state.stream.stream_info().await?;
    let group_info = state
        .stream
        .group_info(intake_core::stream::EVENT_PROCESSORS_GROUP)
        .await?;
    let failed_events =
        state.events.count_by_status(EventStatus::Failed).await?;
    let pending_suggestions = state.suggestions_repo.count_pending().await?;

    Ok(axum::Json(json!({
        "stream_length": stream_info.length,
        "group_pending": group_info.pending,
        "group_consumers": group_info.consumers,
        "failed_events": failed_events,
        "pending_suggestions": pending_suggestions,
    })))
}

async fn worker_status(
    State(state): State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(json!({"workers": state.supervisor.states()}))
}

#[derive(Deserialize)]
struct WebhookPayload {
    content: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    user_external_id: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    context: BTreeMap<String, String>,
}

async fn ingest_webhook(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    axum::Json(payload): axum::Json<WebhookPayload>,
) -> Result<(StatusCode, axum::Json<serde_json::Value>), ApiError> {
    let event_id = Uuid::new_v4();
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| payload.idempotency_key.clone())
        .or_else(|| {
            payload
                .source_id
                .as_ref()
                .map(|id| format!("webhook:{source}:{id}"))
        })
        .unwrap_or_else(|| format!("webhook:{source}:{event_id}"));

    let mut event = UnifiedEvent::new(
        EventType::Webhook,
        EventSource::Webhook,
        idempotency_key,
        payload.content,
        Utc::now(),
    );
    event.event_id = event_id;
    event.source_id = payload.source_id;
    event.user_external_id = payload.user_external_id;
    event.user_name = payload.user_name;
    event.session_id = payload.session_id;
    event.thread_id = payload.thread_id;
    event.metadata = payload.metadata;
    event.context = payload.context;
    event
        .metadata
        .insert("webhook_source".to_owned(), source.clone());
    if let Some(content_type) = payload.content_type {
        event.content_type = content_type.parse().map_err(|_| {
            ApiError(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown content type: {content_type}"),
            )
        })?;
    }
    if let Some(priority) = payload.priority {
        event.priority = priority.parse::<Priority>().map_err(|_| {
            ApiError(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown priority: {priority}"),
            )
        })?;
    }

    let stream_id = state.stream.append(&event).await?;
    Ok((
        StatusCode::ACCEPTED,
        axum::Json(json!({
            "event_id": event.event_id,
            "idempotency_key": event.idempotency_key,
            "stream_id": stream_id,
        })),
    ))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn serve_local_blob(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let Some(local) = &state.local_store else {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            "local storage disabled".to_owned(),
        ));
    };

    if !local.authorize_token(&query.token, &key).await? {
        return Err(ApiError(
            StatusCode::FORBIDDEN,
            "invalid or expired token".to_owned(),
        ));
    }

    use intake_core::storage::ObjectStore;
    let bytes = local.get(&key).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

async fn attachment_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    let url = state
        .persistor
        .attachment_url(id, ATTACHMENT_URL_TTL)
        .await?;
    Ok(axum::Json(json!({"url": url})))
}
