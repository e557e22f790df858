//! Conversation session management
//!
//! This module provides the `ConversationSession` state machine that manages:
//! - The session lifecycle (connected, listening, thinking, speaking, stopped/error)
//! - Audio ingestion and end-of-turn detection
//! - Sequencing of transcription, response and synthesis per turn
//! - The single ordered outbound queue and cancellation of in-flight turns
//! - Heartbeat supervision and session statistics

mod config;
mod heartbeat;
mod ingest;
mod outbound;
mod session;
mod state;
mod stats;
mod status;
mod turn;

pub use config::SessionConfig;
pub use heartbeat::HeartbeatMonitor;
pub use ingest::{AudioChunk, AudioIngestBuffer};
pub use outbound::{outbound_channel, OutboundReceiver, OutboundSender, TurnHandle};
pub use session::{ConversationSession, SessionHandle};
pub use state::SessionState;
pub use stats::SessionStats;
pub use status::{announce, status_value};
