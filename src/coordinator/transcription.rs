use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{engine_failure, run_stage, StageOutcome, TranscriptEvent, TranscriptKind};
use crate::engine::{SpeechToText, Transcript};
use crate::error::{SessionError, Stage};
use crate::session::TurnHandle;

/// Relays partial transcripts and exactly one final transcript per turn
pub struct TranscriptionCoordinator {
    engine: Arc<dyn SpeechToText>,
    timeout: Duration,
}

impl TranscriptionCoordinator {
    pub fn new(engine: Arc<dyn SpeechToText>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Transcribe the turn's audio, returning the final transcript text
    ///
    /// An empty final transcript counts as a failure and is not relayed.
    pub async fn run(&self, turn: &TurnHandle, audio: Vec<u8>, lang: &str) -> StageOutcome<String> {
        info!(
            "Turn {}: transcribing {} bytes with {} (lang={})",
            turn.id(),
            audio.len(),
            self.engine.name(),
            lang
        );

        let work = async {
            let mut stream = self
                .engine
                .transcribe(audio, lang, turn.cancel_token().child_token())
                .await
                .map_err(engine_failure(Stage::Transcription))?;

            while let Some(item) = stream.next().await {
                let transcript = item.map_err(engine_failure(Stage::Transcription))?;

                match transcript {
                    Transcript::Partial(text) => {
                        debug!("Turn {}: partial transcript: {}", turn.id(), text);
                        let event = TranscriptEvent {
                            turn_id: turn.id(),
                            kind: TranscriptKind::Partial,
                            text,
                        };
                        turn.emit(event.into()).await?;
                    }
                    Transcript::Final(text) => {
                        let text = text.trim().to_string();
                        if text.is_empty() {
                            return Err(SessionError::Stt("no speech recognized".to_string()));
                        }
                        let event = TranscriptEvent {
                            turn_id: turn.id(),
                            kind: TranscriptKind::Final,
                            text: text.clone(),
                        };
                        turn.emit(event.into()).await?;
                        return Ok(text);
                    }
                }
            }

            Err(SessionError::Stt(
                "engine finished without a final transcript".to_string(),
            ))
        };

        run_stage(turn, Stage::Transcription, self.timeout, work).await
    }
}
