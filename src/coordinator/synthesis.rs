use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{engine_failure, run_stage, AudioOutputChunk, StageOutcome};
use crate::engine::SpeechSynthesizer;
use crate::error::{SessionError, Stage};
use crate::session::TurnHandle;

/// Turns the reply text into ordered audio chunks
pub struct SynthesisCoordinator {
    engine: Arc<dyn SpeechSynthesizer>,
    timeout: Duration,
    segment_sentences: bool,
}

impl SynthesisCoordinator {
    pub fn new(engine: Arc<dyn SpeechSynthesizer>, timeout: Duration, segment_sentences: bool) -> Self {
        Self {
            engine,
            timeout,
            segment_sentences,
        }
    }

    /// Synthesize `text` for the turn, returning the number of chunks relayed
    ///
    /// Chunk sequence numbers start at 0 and keep increasing across
    /// segments. The timeout applies to each engine call.
    pub async fn run(&self, turn: &TurnHandle, text: &str) -> StageOutcome<u64> {
        let segments = if self.segment_sentences {
            split_sentences(text)
        } else {
            vec![text.trim().to_string()]
        };

        info!(
            "Turn {}: synthesizing {} segment(s) with {}",
            turn.id(),
            segments.len(),
            self.engine.name()
        );

        let mut seq = 0u64;

        for segment in segments.iter().filter(|s| !s.is_empty()) {
            let outcome = {
                let work = async {
                    let mut stream = self
                        .engine
                        .synthesize(segment, turn.cancel_token().child_token())
                        .await
                        .map_err(engine_failure(Stage::Synthesis))?;

                    while let Some(item) = stream.next().await {
                        let audio = item.map_err(engine_failure(Stage::Synthesis))?;
                        if audio.payload.is_empty() {
                            continue;
                        }
                        let chunk = AudioOutputChunk {
                            turn_id: turn.id(),
                            seq,
                            format: audio.format,
                            payload: audio.payload,
                        };
                        turn.emit(chunk.into()).await?;
                        seq += 1;
                    }
                    Ok(())
                };

                run_stage(turn, Stage::Synthesis, self.timeout, work).await
            };

            match outcome {
                StageOutcome::Completed(()) => {
                    debug!("Turn {}: segment done, {} chunks so far", turn.id(), seq);
                }
                StageOutcome::Cancelled => return StageOutcome::Cancelled,
                StageOutcome::Failed(e) => return StageOutcome::Failed(e),
            }
        }

        if seq == 0 {
            return StageOutcome::Failed(SessionError::Tts("no audio produced".to_string()));
        }

        StageOutcome::Completed(seq)
    }
}

/// Split text into sentences, keeping the terminating punctuation
///
/// A terminator only ends a sentence when followed by whitespace or the end
/// of the text, so decimals like `3.5` stay intact. Line breaks always end a
/// sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    let mut flush = |current: &mut String| {
        let sentence = current.trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        current.clear();
    };

    while let Some(c) = chars.next() {
        if c == '\n' {
            flush(&mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '…') && chars.peek().map_or(true, |n| n.is_whitespace()) {
            flush(&mut current);
        }
    }
    flush(&mut current);

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineStream, SynthesizedAudio};
    use crate::protocol::{Outbound, OutboundMessage};
    use futures::stream;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Two chunks per call; records the text of every call
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SpeechSynthesizer for Recording {
        async fn synthesize(
            &self,
            text: &str,
            _cancel: CancellationToken,
        ) -> anyhow::Result<EngineStream<SynthesizedAudio>> {
            self.calls.lock().unwrap().push(text.to_string());
            if self.fail {
                anyhow::bail!("piper returned 500");
            }
            let chunks = vec![
                Ok(SynthesizedAudio {
                    format: "audio/wav".to_string(),
                    payload: vec![1, 2],
                }),
                Ok(SynthesizedAudio {
                    format: "audio/wav".to_string(),
                    payload: vec![3],
                }),
            ];
            Ok(stream::iter(chunks).boxed())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn chunk_seqs(rx: &mut crate::session::OutboundReceiver) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(OutboundMessage::TtsAudioChunk { seq, .. }) = item {
                seqs.push(seq);
            }
        }
        seqs
    }

    #[tokio::test]
    async fn test_sequence_spans_sentences() {
        let (turn, mut rx) = TurnHandle::detached(32).await;
        let engine = Arc::new(Recording::default());
        let coordinator = SynthesisCoordinator::new(engine.clone(), Duration::from_secs(5), true);

        let outcome = coordinator.run(&turn, "Olá! Como posso ajudar?").await;
        assert_eq!(outcome, StageOutcome::Completed(4));
        assert_eq!(chunk_seqs(&mut rx), vec![0, 1, 2, 3]);
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec!["Olá!".to_string(), "Como posso ajudar?".to_string()]
        );
    }

    #[tokio::test]
    async fn test_whole_text_when_not_segmenting() {
        let (turn, _rx) = TurnHandle::detached(32).await;
        let engine = Arc::new(Recording::default());
        let coordinator = SynthesisCoordinator::new(engine.clone(), Duration::from_secs(5), false);

        coordinator.run(&turn, "Olá! Como posso ajudar?").await;
        assert_eq!(engine.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_error_is_synthesis_failure() {
        let (turn, mut rx) = TurnHandle::detached(32).await;
        let engine = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let coordinator = SynthesisCoordinator::new(engine, Duration::from_secs(5), true);

        let outcome = coordinator.run(&turn, "Olá!").await;
        assert!(matches!(outcome, StageOutcome::Failed(SessionError::Tts(_))));
        assert!(chunk_seqs(&mut rx).is_empty());
    }

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("Olá! São 3.5 euros. Mais alguma coisa?"),
            vec!["Olá!", "São 3.5 euros.", "Mais alguma coisa?"]
        );
        assert_eq!(split_sentences("linha um\nlinha dois"), vec!["linha um", "linha dois"]);
        assert_eq!(split_sentences("sem pontuação"), vec!["sem pontuação"]);
        assert!(split_sentences("  \n ").is_empty());
    }
}
