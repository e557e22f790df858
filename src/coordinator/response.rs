use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{engine_failure, run_stage, FinalResponse, ResponseDelta, StageOutcome};
use crate::engine::{Generation, LanguageModel, TurnContext};
use crate::error::{SessionError, Stage};
use crate::session::TurnHandle;

/// Prefix of tool directives the model appends to a reply
const ACTION_PREFIX: &str = "ACTION:";

/// Streams model deltas and closes each turn with exactly one final response
pub struct ResponseCoordinator {
    engine: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl ResponseCoordinator {
    pub fn new(engine: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Generate the reply for one turn
    ///
    /// On failure after some deltas were relayed, the turn is still closed
    /// with a final response assembled from those deltas before the failure
    /// is reported.
    pub async fn run(&self, turn: &TurnHandle, context: &TurnContext) -> StageOutcome<FinalResponse> {
        info!(
            "Turn {}: generating reply with {} ({} history messages)",
            turn.id(),
            self.engine.name(),
            context.history.len()
        );

        let mut text = String::new();
        let mut deltas = 0u64;

        let outcome = {
            let work = async {
                let mut stream = self
                    .engine
                    .generate(context, turn.cancel_token().child_token())
                    .await
                    .map_err(engine_failure(Stage::Generation))?;

                while let Some(item) = stream.next().await {
                    match item.map_err(engine_failure(Stage::Generation))? {
                        Generation::Delta(chunk) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            let delta = ResponseDelta {
                                turn_id: turn.id(),
                                seq: deltas,
                                text: chunk.clone(),
                            };
                            turn.emit(delta.into()).await?;
                            text.push_str(&chunk);
                            deltas += 1;
                        }
                        Generation::Done => return Ok(()),
                    }
                }

                Err(SessionError::Llm("stream ended before completion".to_string()))
            };

            run_stage(turn, Stage::Generation, self.timeout, work).await
        };

        // Whitespace-only deltas still have to be closed with a final below
        let outcome = match outcome {
            StageOutcome::Completed(()) if text.trim().is_empty() => StageOutcome::Failed(
                SessionError::Llm("model returned an empty response".to_string()),
            ),
            outcome => outcome,
        };

        match outcome {
            StageOutcome::Completed(()) => {
                let response = FinalResponse {
                    turn_id: turn.id(),
                    text,
                    deltas,
                };
                match turn.emit((&response).into()).await {
                    Ok(()) => StageOutcome::Completed(response),
                    Err(SessionError::Cancelled) => StageOutcome::Cancelled,
                    Err(e) => StageOutcome::Failed(e),
                }
            }
            StageOutcome::Cancelled => StageOutcome::Cancelled,
            StageOutcome::Failed(error) if deltas > 0 && !error.is_fatal() => {
                warn!(
                    "Turn {}: generation failed after {} deltas, closing with partial text",
                    turn.id(),
                    deltas
                );
                let partial = FinalResponse {
                    turn_id: turn.id(),
                    text,
                    deltas,
                };
                match turn.emit((&partial).into()).await {
                    Err(SessionError::Cancelled) => StageOutcome::Cancelled,
                    Err(e) if e.is_fatal() => StageOutcome::Failed(e),
                    _ => StageOutcome::Failed(error),
                }
            }
            StageOutcome::Failed(error) => StageOutcome::Failed(error),
        }
    }
}

/// The part of a reply meant to be spoken: tool directive lines removed
pub fn speakable_text(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with(ACTION_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineStream;
    use crate::protocol::{Outbound, OutboundMessage};
    use futures::stream;
    use tokio_util::sync::CancellationToken;

    struct Scripted(Vec<anyhow::Result<Generation>>);

    #[async_trait::async_trait]
    impl LanguageModel for Scripted {
        async fn generate(
            &self,
            _context: &TurnContext,
            _cancel: CancellationToken,
        ) -> anyhow::Result<EngineStream<Generation>> {
            let items: Vec<anyhow::Result<Generation>> = self
                .0
                .iter()
                .map(|item| match item {
                    Ok(g) => Ok(g.clone()),
                    Err(e) => Err(anyhow::anyhow!("{}", e)),
                })
                .collect();
            Ok(stream::iter(items).boxed())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Never produces anything until cancelled
    struct Stalled;

    #[async_trait::async_trait]
    impl LanguageModel for Stalled {
        async fn generate(
            &self,
            _context: &TurnContext,
            _cancel: CancellationToken,
        ) -> anyhow::Result<EngineStream<Generation>> {
            Ok(stream::pending().boxed())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    fn context() -> TurnContext {
        TurnContext {
            session_id: "s".to_string(),
            turn_id: 1,
            user_id: "u".to_string(),
            conversation_id: None,
            lang: "pt-PT".to_string(),
            transcript: "olá".to_string(),
            history: Vec::new(),
        }
    }

    fn messages(rx: &mut crate::session::OutboundReceiver) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(Outbound::Message(m)) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn test_deltas_then_final() {
        let (turn, mut rx) = TurnHandle::detached(16).await;
        messages(&mut rx);

        let coordinator = ResponseCoordinator::new(
            Arc::new(Scripted(vec![
                Ok(Generation::Delta("Olá, ".to_string())),
                Ok(Generation::Delta("tudo bem?".to_string())),
                Ok(Generation::Done),
            ])),
            Duration::from_secs(5),
        );

        let outcome = coordinator.run(&turn, &context()).await;
        let StageOutcome::Completed(response) = outcome else {
            panic!("expected a completed response");
        };
        assert_eq!(response.text, "Olá, tudo bem?");
        assert_eq!(response.deltas, 2);

        assert_eq!(
            messages(&mut rx),
            vec![
                OutboundMessage::LlmTextDelta {
                    text: "Olá, ".to_string()
                },
                OutboundMessage::LlmTextDelta {
                    text: "tudo bem?".to_string()
                },
                OutboundMessage::LlmTextFinal {
                    text: "Olá, tudo bem?".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_after_deltas_closes_with_partial_final() {
        let (turn, mut rx) = TurnHandle::detached(16).await;
        messages(&mut rx);

        let coordinator = ResponseCoordinator::new(
            Arc::new(Scripted(vec![
                Ok(Generation::Delta("Hoje ".to_string())),
                Err(anyhow::anyhow!("connection reset")),
            ])),
            Duration::from_secs(5),
        );

        let outcome = coordinator.run(&turn, &context()).await;
        assert!(matches!(outcome, StageOutcome::Failed(SessionError::Llm(_))));
        assert_eq!(
            messages(&mut rx),
            vec![
                OutboundMessage::LlmTextDelta {
                    text: "Hoje ".to_string()
                },
                OutboundMessage::LlmTextFinal {
                    text: "Hoje ".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_reply_is_closed_before_failing() {
        let (turn, mut rx) = TurnHandle::detached(16).await;
        messages(&mut rx);

        let coordinator = ResponseCoordinator::new(
            Arc::new(Scripted(vec![
                Ok(Generation::Delta("\n".to_string())),
                Ok(Generation::Done),
            ])),
            Duration::from_secs(5),
        );

        let outcome = coordinator.run(&turn, &context()).await;
        assert!(matches!(outcome, StageOutcome::Failed(SessionError::Llm(_))));
        assert_eq!(
            messages(&mut rx),
            vec![
                OutboundMessage::LlmTextDelta {
                    text: "\n".to_string()
                },
                OutboundMessage::LlmTextFinal {
                    text: "\n".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_reply_without_deltas_emits_nothing() {
        let (turn, mut rx) = TurnHandle::detached(16).await;
        messages(&mut rx);

        let coordinator = ResponseCoordinator::new(
            Arc::new(Scripted(vec![Ok(Generation::Done)])),
            Duration::from_secs(5),
        );

        let outcome = coordinator.run(&turn, &context()).await;
        assert!(matches!(outcome, StageOutcome::Failed(SessionError::Llm(_))));
        assert!(messages(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_failure_without_deltas_emits_nothing() {
        let (turn, mut rx) = TurnHandle::detached(16).await;
        messages(&mut rx);

        let coordinator = ResponseCoordinator::new(
            Arc::new(Scripted(vec![Err(anyhow::anyhow!("model not found"))])),
            Duration::from_secs(5),
        );

        let outcome = coordinator.run(&turn, &context()).await;
        assert!(matches!(outcome, StageOutcome::Failed(SessionError::Llm(_))));
        assert!(messages(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_generation_failure() {
        let (turn, _rx) = TurnHandle::detached(16).await;
        let coordinator = ResponseCoordinator::new(Arc::new(Stalled), Duration::from_secs(3));

        let outcome = coordinator.run(&turn, &context()).await;
        assert_eq!(
            outcome,
            StageOutcome::Failed(SessionError::Timeout {
                stage: Stage::Generation,
                after: Duration::from_secs(3),
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_turn_reports_cancelled() {
        let (turn, _rx) = TurnHandle::detached(16).await;
        let coordinator = ResponseCoordinator::new(Arc::new(Stalled), Duration::from_secs(30));

        let cancel = turn.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert_eq!(
            coordinator.run(&turn, &context()).await,
            StageOutcome::Cancelled
        );
    }

    #[test]
    fn test_speakable_text_strips_actions() {
        let reply = "Adicionei leite à lista.\nACTION: {\"tool\": \"shopping_add\", \"item\": \"leite\"}";
        assert_eq!(speakable_text(reply), "Adicionei leite à lista.");
        assert_eq!(speakable_text("  ACTION: {\"tool\": \"notes\"}\n"), "");
        assert_eq!(speakable_text("Sem ações"), "Sem ações");
    }
}
