//! Per-turn coordinators around the external engines
//!
//! Each coordinator makes one stage's external call with the turn's
//! cancellation token and a per-call timeout, relays the engine's output
//! to the client through the turn's `TurnHandle`, and reports a
//! `StageOutcome` that makes cancellation explicit instead of inferring it
//! from silence.

mod response;
mod synthesis;
mod transcription;

pub use response::{speakable_text, ResponseCoordinator};
pub use synthesis::{split_sentences, SynthesisCoordinator};
pub use transcription::TranscriptionCoordinator;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{ConversationStore, LanguageModel, SpeechSynthesizer, SpeechToText};
use crate::error::{SessionError, SessionResult, Stage};
use crate::protocol::OutboundMessage;
use crate::session::{SessionConfig, TurnHandle};

/// How a stage ended
#[derive(Debug, PartialEq)]
pub enum StageOutcome<T> {
    Completed(T),
    /// The turn was cancelled; nothing more may be said for it
    Cancelled,
    Failed(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    Partial,
    Final,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub turn_id: u64,
    pub kind: TranscriptKind,
    pub text: String,
}

impl From<TranscriptEvent> for OutboundMessage {
    fn from(event: TranscriptEvent) -> Self {
        match event.kind {
            TranscriptKind::Partial => OutboundMessage::PartialTranscript { text: event.text },
            TranscriptKind::Final => OutboundMessage::FinalTranscript { text: event.text },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDelta {
    pub turn_id: u64,
    pub seq: u64,
    pub text: String,
}

impl From<ResponseDelta> for OutboundMessage {
    fn from(delta: ResponseDelta) -> Self {
        OutboundMessage::LlmTextDelta { text: delta.text }
    }
}

/// Concatenation boundary of a turn's deltas
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResponse {
    pub turn_id: u64,
    pub text: String,
    pub deltas: u64,
}

impl From<&FinalResponse> for OutboundMessage {
    fn from(response: &FinalResponse) -> Self {
        OutboundMessage::LlmTextFinal {
            text: response.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioOutputChunk {
    pub turn_id: u64,
    pub seq: u64,
    pub format: String,
    pub payload: Vec<u8>,
}

impl From<AudioOutputChunk> for OutboundMessage {
    fn from(chunk: AudioOutputChunk) -> Self {
        OutboundMessage::audio_chunk(chunk.format, chunk.seq, &chunk.payload)
    }
}

/// Maps an engine error onto the failure variant of its stage
pub(crate) fn engine_failure(stage: Stage) -> impl Fn(anyhow::Error) -> SessionError + Copy {
    move |e| SessionError::stage_failure(stage, format!("{:#}", e))
}

/// Race one stage's work against the turn's cancellation and a timeout
pub(crate) async fn run_stage<T, F>(
    turn: &TurnHandle,
    stage: Stage,
    limit: Duration,
    work: F,
) -> StageOutcome<T>
where
    F: Future<Output = SessionResult<T>>,
{
    let cancel = turn.cancel_token().clone();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => StageOutcome::Cancelled,
        result = tokio::time::timeout(limit, work) => match result {
            Err(_) => StageOutcome::Failed(SessionError::Timeout { stage, after: limit }),
            Ok(Ok(value)) => StageOutcome::Completed(value),
            Ok(Err(SessionError::Cancelled)) => StageOutcome::Cancelled,
            Ok(Err(e)) => StageOutcome::Failed(e),
        },
    }
}

/// The external collaborators a session talks to
#[derive(Clone)]
pub struct Engines {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn SpeechSynthesizer>,
    pub store: Arc<dyn ConversationStore>,
}

/// Coordinators shared by every session of a gateway
pub struct Pipeline {
    pub transcription: TranscriptionCoordinator,
    pub response: ResponseCoordinator,
    pub synthesis: SynthesisCoordinator,
    pub store: Arc<dyn ConversationStore>,
}

impl Pipeline {
    pub fn new(engines: Engines, config: &SessionConfig) -> Self {
        Self {
            transcription: TranscriptionCoordinator::new(
                engines.stt,
                config.transcription_timeout(),
            ),
            response: ResponseCoordinator::new(engines.llm, config.generation_timeout()),
            synthesis: SynthesisCoordinator::new(
                engines.tts,
                config.synthesis_timeout(),
                config.segment_sentences,
            ),
            store: engines.store,
        }
    }
}
