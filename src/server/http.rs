//! REST endpoints. Every `/api` response uses the envelope
//! `{ ok, message, result, error: {code, details?} | null }`.

use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use super::AppState;
use crate::auth::AuthUser;
use crate::error::{AuthError, DatabaseError, JobError, ValidationError};
use crate::queue::{ChatAction, Job, JobId, JobPayload};

/// Header carrying the caller's WebSocket client id.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

const DEFAULT_PAGE: usize = 20;
const DEFAULT_MESSAGE_PAGE: usize = 50;
const MAX_PAGE: usize = 100;

// ── Envelope ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    message: Option<String>,
    result: Option<T>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

fn respond<T: Serialize>(status: StatusCode, result: T) -> Response {
    (
        status,
        Json(Envelope {
            ok: true,
            message: None,
            result: Some(result),
            error: None,
        }),
    )
        .into_response()
}

/// Failure response of an `/api` handler.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiFailure {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"))
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(Envelope::<()> {
                ok: false,
                message: Some(self.message),
                result: None,
                error: Some(ErrorBody {
                    code: self.code,
                    details: None,
                }),
            }),
        )
            .into_response()
    }
}

impl From<AuthError> for ApiFailure {
    fn from(e: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", e.to_string())
    }
}

impl From<ValidationError> for ApiFailure {
    fn from(e: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string())
    }
}

impl From<DatabaseError> for ApiFailure {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { entity, .. } => Self::not_found(&entity),
            other => {
                error!(error = %other, "Storage failure in request");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "Internal server error",
                )
            }
        }
    }
}

impl From<JobError> for ApiFailure {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { .. } => Self::not_found("job"),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiFailure {
    fn from(e: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.body_text())
    }
}

// ── Auth ────────────────────────────────────────────────────────────────

/// Resolve the bearer token and stash the [`AuthUser`] for handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiFailure> {
    let user = state.auth.authenticate(req.headers())?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-relay"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

fn default_action() -> i64 {
    1
}

/// Accept `2` as well as `"2"`.
fn lenient_action<'de, D: serde::Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    use serde::de::Error as _;

    match Value::deserialize(de)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("invalid action {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid action {s:?}"))),
        Value::Null => Ok(default_action()),
        other => Err(D::Error::custom(format!("invalid action {other}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    message: Option<String>,
    conversation_id: Option<String>,
    #[serde(default = "default_action", deserialize_with = "lenient_action")]
    action: i64,
    payload: Option<Value>,
    client_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    delay_ms: Option<u64>,
}

pub async fn enqueue_chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiFailure> {
    let Json(body) = body?;
    ChatAction::from_parts(body.action, body.message.as_deref(), body.payload.as_ref())?;

    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or(body.client_id.filter(|c| !c.is_empty()));

    info!(
        user_id = %user.user_id,
        client_id = ?client_id,
        conversation_id = ?body.conversation_id,
        action = body.action,
        message_len = body.message.as_deref().map(str::len),
        "Enqueue chat request"
    );

    let payload = JobPayload {
        message: body.message,
        conversation_id: body.conversation_id,
        client_id,
        user_id: user.user_id,
        action: body.action,
        payload: body.payload,
        expires_at: body.expires_at,
    };

    let job_id = match body.delay_ms.filter(|ms| *ms > 0) {
        Some(ms) => {
            state
                .queue
                .enqueue_delayed(payload, Duration::from_millis(ms))
                .await
        }
        None => state.queue.enqueue(payload).await,
    };

    Ok(respond(
        StatusCode::ACCEPTED,
        serde_json::json!({ "jobId": job_id }),
    ))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiFailure> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiFailure::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Invalid job ID"))
}

/// The caller's job, or 404 for unknown and foreign jobs alike.
async fn owned_job(state: &AppState, user: &AuthUser, job_id: JobId) -> Result<Job, ApiFailure> {
    state
        .queue
        .get(job_id)
        .await
        .filter(|job| job.payload.user_id == user.user_id)
        .ok_or_else(|| ApiFailure::not_found("job"))
}

#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    job: Job,
    /// 1-based position while waiting.
    position: Option<usize>,
}

pub async fn get_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Response, ApiFailure> {
    let job_id = parse_job_id(&id)?;
    let job = owned_job(&state, &user, job_id).await?;
    let position = state.queue.position(job_id).await;
    Ok(respond(StatusCode::OK, JobView { job, position }))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Response, ApiFailure> {
    let job_id = parse_job_id(&id)?;
    owned_job(&state, &user, job_id).await?;

    let removed = state.queue.remove(job_id).await?;
    info!(job_id = %job_id, user_id = %user.user_id, state = %removed.state, "Job cancelled by owner");
    state.broadcaster.broadcast_stats().await;

    Ok(respond(
        StatusCode::OK,
        serde_json::json!({ "jobId": job_id, "state": removed.state }),
    ))
}

pub async fn queue_stats(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.queue.stats().await)
}

// ── Conversations ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Page {
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Page>,
) -> Result<Response, ApiFailure> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let conversations = state
        .store
        .list_user_conversations(&user.user_id, limit, page.offset.unwrap_or(0))
        .await?;
    Ok(respond(StatusCode::OK, conversations))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(page): Query<Page>,
) -> Result<Response, ApiFailure> {
    let limit = page.limit.unwrap_or(DEFAULT_MESSAGE_PAGE).clamp(1, MAX_PAGE);
    let messages = state
        .store
        .page_conversation_messages(&user.user_id, &id, limit, page.offset.unwrap_or(0))
        .await?;
    Ok(respond(StatusCode::OK, messages))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    liked: Option<bool>,
}

pub async fn message_feedback(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    body: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<Response, ApiFailure> {
    let Json(body) = body?;
    let liked = body.liked.ok_or_else(|| ValidationError::InvalidField {
        field: "liked".to_string(),
        reason: "must be true or false".to_string(),
    })?;
    let message = state
        .store
        .set_message_feedback(&user.user_id, &id, liked)
        .await?;
    Ok(respond(StatusCode::OK, message))
}
