use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SessionState;

/// Snapshot of a conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// Owner, as established at connect time
    pub user_id: String,

    pub state: SessionState,

    /// Conversation the session's turns are recorded under
    pub conversation_id: Option<String>,

    /// Negotiated language tag (e.g. "pt-PT")
    pub lang: String,

    /// When the connection was accepted
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Turn currently in flight, if any
    pub active_turn: Option<u64>,

    pub turns_completed: u64,
    pub turns_failed: u64,
    pub turns_cancelled: u64,

    /// Audio fragments accepted into the ingest buffer
    pub audio_fragments: u64,
    pub audio_bytes: u64,

    pub protocol_violations: u64,
}
