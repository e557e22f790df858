use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SessionError;

/// Lifecycle of one conversation session
///
/// `Connected → Listening → Thinking → Speaking → Listening …`, with
/// `Stopped` and `Error` reachable from anywhere. Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Listening,
    Thinking,
    Speaking,
    Stopped,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }

    /// A turn's response or synthesis is in flight
    pub fn turn_in_flight(self) -> bool {
        matches!(self, SessionState::Thinking | SessionState::Speaking)
    }

    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, to) {
            (_, Stopped) | (_, Error) => true,
            (Connected, Listening) => true,
            (Listening, Listening) => true,
            (Listening, Thinking) => true,
            (Thinking, Speaking) => true,
            (Thinking, Listening) => true,
            (Speaking, Listening) => true,
            _ => false,
        }
    }

    /// Validate and apply a transition, returning the previous state
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, SessionError> {
        if !self.can_transition(to) {
            return Err(SessionError::ProtocolViolation(format!(
                "illegal transition {} -> {}",
                self, to
            )));
        }

        let from = *self;
        *self = to;
        Ok(from)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connected => "connected",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}
