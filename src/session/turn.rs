//! One turn: transcription, response and synthesis for a buffered utterance

use tracing::{info, warn};

use super::outbound::{SessionCounters, TurnHandle};
use super::state::SessionState;
use crate::coordinator::{speakable_text, Pipeline, StageOutcome};
use crate::engine::TurnContext;
use crate::error::SessionError;
use crate::protocol::OutboundMessage;

/// How a turn ended, as reported back to the session task
#[derive(Debug, PartialEq)]
pub(crate) enum TurnOutcome {
    Completed,
    /// Recovered: one `error` was sent and the session is listening again
    Failed(SessionError),
    Cancelled,
    /// The session cannot continue
    Fatal(SessionError),
}

impl TurnOutcome {
    pub(crate) fn record(&self, counters: &mut SessionCounters) {
        match self {
            TurnOutcome::Completed => counters.turns_completed += 1,
            TurnOutcome::Failed(_) | TurnOutcome::Fatal(_) => counters.turns_failed += 1,
            // Counted when the session terminated
            TurnOutcome::Cancelled => {}
        }
    }

    fn interrupted(error: SessionError) -> Self {
        match error {
            SessionError::Cancelled => TurnOutcome::Cancelled,
            e if e.is_fatal() => TurnOutcome::Fatal(e),
            e => TurnOutcome::Failed(e),
        }
    }
}

pub(crate) async fn run(pipeline: &Pipeline, turn: &TurnHandle, audio: Vec<u8>) -> TurnOutcome {
    let shared = turn.shared();
    let lang = shared.lang().await;

    let transcript = match pipeline.transcription.run(turn, audio, &lang).await {
        StageOutcome::Completed(text) => text,
        StageOutcome::Cancelled => return TurnOutcome::Cancelled,
        StageOutcome::Failed(error) => return recover(turn, error).await,
    };

    let conversation_id = match shared.conversation_id().await {
        Some(id) => Some(id),
        None => match pipeline.store.create_conversation(turn.user_id()).await {
            Ok(id) => {
                info!("Session {}: started conversation {}", turn.session_id(), id);
                shared.attach_conversation(id.clone()).await;
                Some(id)
            }
            Err(e) => {
                warn!("Could not create conversation: {:#}", e);
                None
            }
        },
    };

    let history = match &conversation_id {
        Some(id) => pipeline
            .store
            .history(turn.user_id(), id)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not load history of conversation {}: {:#}", id, e);
                Vec::new()
            }),
        None => Vec::new(),
    };

    let context = TurnContext {
        session_id: turn.session_id().to_string(),
        turn_id: turn.id(),
        user_id: turn.user_id().to_string(),
        conversation_id: conversation_id.clone(),
        lang,
        transcript,
        history,
    };

    let response = match pipeline.response.run(turn, &context).await {
        StageOutcome::Completed(response) => response,
        StageOutcome::Cancelled => return TurnOutcome::Cancelled,
        StageOutcome::Failed(error) => return recover(turn, error).await,
    };

    if let Some(id) = &conversation_id {
        if let Err(e) = pipeline
            .store
            .append_exchange(turn.user_id(), id, &context.transcript, &response.text)
            .await
        {
            warn!("Could not record exchange in conversation {}: {:#}", id, e);
        }
    }

    let speech = speakable_text(&response.text);
    if speech.is_empty() {
        info!("Turn {}: nothing to speak", turn.id());
        return match turn.advance(SessionState::Listening).await {
            Ok(()) => TurnOutcome::Completed,
            Err(e) => TurnOutcome::interrupted(e),
        };
    }

    if let Err(e) = turn.advance(SessionState::Speaking).await {
        return TurnOutcome::interrupted(e);
    }

    let chunks = match pipeline.synthesis.run(turn, &speech).await {
        StageOutcome::Completed(chunks) => chunks,
        StageOutcome::Cancelled => return TurnOutcome::Cancelled,
        StageOutcome::Failed(error) => return recover(turn, error).await,
    };

    if let Err(e) = turn.advance(SessionState::Listening).await {
        return TurnOutcome::interrupted(e);
    }

    info!("Turn {}: completed with {} audio chunks", turn.id(), chunks);
    TurnOutcome::Completed
}

/// Report a turn-scoped failure and go back to listening
async fn recover(turn: &TurnHandle, error: SessionError) -> TurnOutcome {
    if error.is_fatal() {
        return TurnOutcome::Fatal(error);
    }

    match error.stage() {
        Some(stage) => warn!("Turn {}: {} failed: {}", turn.id(), stage, error),
        None => warn!("Turn {}: {}", turn.id(), error),
    }

    let reported = async {
        turn.emit(OutboundMessage::error(error.to_string())).await?;
        turn.advance(SessionState::Listening).await
    };

    match reported.await {
        Ok(()) => TurnOutcome::Failed(error),
        Err(e) => TurnOutcome::interrupted(e),
    }
}
