//! Route handlers for the HTTP edge (spec §6).

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use log::info;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AppError, AppResult};
use crate::session::{CloseReason, SessionRecord, SessionSpec};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    pub name: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub created: bool,
}

/// `POST /sessions` (spec §6).
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> AppResult<(StatusCode, Json<CreateSessionResponse>)> {
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let spec = SessionSpec {
        name: request.name,
        repo_url: request.repo_url,
        branch: request.branch,
        credential: request.credential,
    };

    let (record, created) = state.sessions.get_or_create(&session_id, spec).await?;
    info!("session {session_id} get_or_create (created={created})");

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(CreateSessionResponse { record, created })))
}

/// `GET /sessions/{id}` (spec §6).
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionRecord>> {
    state
        .sessions
        .lookup(&session_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(session_id))
}

/// `GET /sessions` (spec §6).
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionRecord>> {
    Json(state.sessions.list())
}

/// `DELETE /sessions/{id}` (spec §6): explicit deletion, destroys the
/// workspace (spec §3).
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<StatusCode> {
    state.chat.interrupt(&session_id);
    state
        .sessions
        .close(&session_id, CloseReason::UserRequested)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub content: String,
    #[serde(default)]
    pub task_tag: String,
}

/// `POST /chat/stream/{session_id}` (spec §6): server-sent-event stream,
/// final event one of `result`/`error`/`interrupted`.
pub async fn chat_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> AppResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let rx = state
        .chat
        .chat_stream(&session_id, &request.content, &request.task_tag)
        .await?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let name = event.sse_event_name();
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(name).data(payload))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `POST /chat/{session_id}` (spec §6): non-streaming, buffers the whole
/// turn.
pub async fn chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> AppResult<Json<Vec<crate::chat::ChatEvent>>> {
    let events = state
        .chat
        .chat(&session_id, &request.content, &request.task_tag)
        .await?;
    Ok(Json(events))
}

/// `POST /chat/interrupt/{session_id}` (spec §6): synchronous ack.
pub async fn chat_interrupt(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.chat.interrupt(&session_id);
    StatusCode::NO_CONTENT
}

/// `GET /healthz` (spec §6): process liveness only, not part of the core
/// state machine.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
