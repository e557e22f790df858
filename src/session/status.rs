//! Status broadcaster: projects state transitions onto `status` messages

use super::state::SessionState;
use crate::protocol::{OutboundMessage, StatusValue};

pub fn status_value(state: SessionState) -> StatusValue {
    match state {
        SessionState::Connected => StatusValue::Connected,
        SessionState::Listening => StatusValue::Listening,
        SessionState::Thinking => StatusValue::Thinking,
        SessionState::Speaking => StatusValue::Speaking,
        SessionState::Stopped => StatusValue::Stopped,
        SessionState::Error => StatusValue::Error,
    }
}

/// Status message for a transition; `None` when the state did not change
pub fn announce(from: SessionState, to: SessionState) -> Option<OutboundMessage> {
    if from == to {
        return None;
    }
    Some(OutboundMessage::status(status_value(to)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_duplicate_adjacent_status() {
        assert_eq!(announce(SessionState::Listening, SessionState::Listening), None);
    }

    #[test]
    fn test_transition_announces_target() {
        assert_eq!(
            announce(SessionState::Thinking, SessionState::Speaking),
            Some(OutboundMessage::status(StatusValue::Speaking))
        );
        assert_eq!(
            announce(SessionState::Speaking, SessionState::Stopped),
            Some(OutboundMessage::status(StatusValue::Stopped))
        );
    }
}
