//! Router assembly for the HTTP edge (spec §6).

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(handlers::create_session))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{session_id}", get(handlers::get_session))
        .route("/sessions/{session_id}", delete(handlers::delete_session))
        .route("/chat/stream/{session_id}", post(handlers::chat_stream))
        .route("/chat/interrupt/{session_id}", post(handlers::chat_interrupt))
        .route("/chat/{session_id}", post(handlers::chat))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
