use super::state::AppState;
use crate::session::SessionStats;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::info;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn not_found(session_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Session {} not found", session_id),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /sessions
/// List live sessions with their statistics
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let handles: Vec<_> = state.sessions.read().await.values().cloned().collect();

    let mut sessions = Vec::with_capacity(handles.len());
    for handle in handles {
        sessions.push(handle.stats().await);
    }
    sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));

    (StatusCode::OK, Json(sessions))
}

/// GET /sessions/:session_id
/// Statistics of one session
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.session(&session_id).await {
        Some(handle) => (StatusCode::OK, Json(handle.stats().await)).into_response(),
        None => not_found(&session_id),
    }
}

/// POST /sessions/:session_id/stop
/// Stop a session as if its client had sent `stop`
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let Some(handle) = state.session(&session_id).await else {
        return not_found(&session_id);
    };

    info!("Stopping session {} on request", session_id);
    let stopped = handle.stop().await;

    (
        StatusCode::OK,
        Json(StopSessionResponse {
            session_id: session_id.clone(),
            status: "stopped".to_string(),
            message: if stopped {
                "Session stopped".to_string()
            } else {
                "Session had already ended".to_string()
            },
            stats: handle.stats().await,
        }),
    )
        .into_response()
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
