//! HTTP gateway for voice clients
//!
//! This module provides the WebSocket endpoint and a small control API:
//! - GET /ws/voice?token=... - Open a conversation session
//! - GET /sessions - List live sessions
//! - GET /sessions/:id - Query one session
//! - POST /sessions/:id/stop - Stop a session
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;
mod ws;

pub use routes::create_router;
pub use state::AppState;
