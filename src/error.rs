//! Error taxonomy for conversation sessions
//!
//! Turn-scoped failures (transcription, generation, synthesis and their
//! timeouts) are contained inside the session: they produce one `error`
//! message and the session returns to listening. Everything else either
//! never enters the state machine (`Auth`) or tears the session down.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Normal closure after a `stop` or heartbeat expiry
pub const CLOSE_NORMAL: u16 = 1000;

/// Unexpected internal failure
pub const CLOSE_INTERNAL: u16 = 4000;

/// Authentication rejected at connect time
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Client kept violating the protocol
pub const CLOSE_PROTOCOL: u16 = 4002;

/// Client stopped draining outbound messages
pub const CLOSE_STALLED: u16 = 4003;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Pipeline stage that an external call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcription,
    Generation,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Transcription => "transcription",
            Stage::Generation => "generation",
            Stage::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transcription failed: {0}")]
    Stt(String),

    #[error("generation failed: {0}")]
    Llm(String),

    #[error("synthesis failed: {0}")]
    Tts(String),

    #[error("{stage} timed out after {}s", .after.as_secs_f32())]
    Timeout { stage: Stage, after: Duration },

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("no keepalive from client within {}s", .0.as_secs_f32())]
    HeartbeatTimeout(Duration),

    #[error("client stopped reading for more than {}s", .0.as_secs_f32())]
    Backpressure(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    /// Build the failure variant belonging to a stage
    pub fn stage_failure(stage: Stage, message: impl Into<String>) -> Self {
        let message = message.into();
        match stage {
            Stage::Transcription => SessionError::Stt(message),
            Stage::Generation => SessionError::Llm(message),
            Stage::Synthesis => SessionError::Tts(message),
        }
    }

    /// Stage a turn-scoped failure belongs to, if any
    ///
    /// Turn-scoped failures keep the connection and return to listening.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SessionError::Stt(_) => Some(Stage::Transcription),
            SessionError::Llm(_) => Some(Stage::Generation),
            SessionError::Tts(_) => Some(Stage::Synthesis),
            SessionError::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Failures that end the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Auth(_)
                | SessionError::ClientDisconnect
                | SessionError::HeartbeatTimeout(_)
                | SessionError::Backpressure(_)
        )
    }

    /// WebSocket close code sent when this error ends the session
    pub fn close_code(&self) -> u16 {
        match self {
            SessionError::Auth(_) => CLOSE_AUTH_FAILED,
            SessionError::ProtocolViolation(_) => CLOSE_PROTOCOL,
            SessionError::Backpressure(_) => CLOSE_STALLED,
            SessionError::ClientDisconnect | SessionError::HeartbeatTimeout(_) => CLOSE_NORMAL,
            _ => CLOSE_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failures_are_turn_scoped() {
        for stage in [Stage::Transcription, Stage::Generation, Stage::Synthesis] {
            let err = SessionError::stage_failure(stage, "boom");
            assert!(!err.is_fatal());
            assert_eq!(err.stage(), Some(stage));
        }
    }

    #[test]
    fn test_timeout_names_stage() {
        let err = SessionError::Timeout {
            stage: Stage::Synthesis,
            after: Duration::from_secs(25),
        };
        assert_eq!(err.to_string(), "synthesis timed out after 25s");
        assert_eq!(err.stage(), Some(Stage::Synthesis));
    }

    #[test]
    fn test_error_messages_name_stage() {
        assert!(SessionError::Stt("x".into()).to_string().contains("transcription"));
        assert!(SessionError::Llm("x".into()).to_string().contains("generation"));
        assert!(SessionError::Tts("x".into()).to_string().contains("synthesis"));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(SessionError::Auth("bad".into()).close_code(), CLOSE_AUTH_FAILED);
        assert_eq!(
            SessionError::Backpressure(Duration::from_secs(5)).close_code(),
            CLOSE_STALLED
        );
        assert_eq!(
            SessionError::ProtocolViolation("junk".into()).close_code(),
            CLOSE_PROTOCOL
        );
        assert!(!SessionError::ProtocolViolation("junk".into()).is_fatal());
    }
}
