use anyhow::{bail, Context, Result};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChatMessage, EngineStream, Generation, LanguageModel, TurnContext};
use crate::config::LlmConfig;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_ctx: u32,
}

/// One NDJSON line of a streaming `/api/chat` response
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// Streaming chat against an Ollama server
pub struct OllamaLanguageModel {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OllamaLanguageModel {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build LLM HTTP client")?;

        Ok(Self { config, client })
    }

    /// System prompt, prior exchanges, then the new user message
    pub fn build_messages(&self, context: &TurnContext) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(context.history.len() + 2);
        messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        messages.extend(
            context
                .history
                .iter()
                .filter(|m| m.role != super::ChatRole::System)
                .cloned(),
        );
        messages.push(ChatMessage::user(context.transcript.clone()));
        messages
    }
}

/// Parse complete lines out of `buffer`, leaving any partial line behind
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Result<Option<Generation>>> {
    let mut out = Vec::new();

    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(parse_line(line));
    }

    out
}

fn parse_line(line: &str) -> Result<Option<Generation>> {
    let chunk: ChatChunk = serde_json::from_str(line).context("Malformed chat chunk")?;

    if let Some(error) = chunk.error {
        bail!("LLM error: {}", error);
    }
    if chunk.done {
        return Ok(Some(Generation::Done));
    }

    match chunk.message {
        Some(message) if !message.content.is_empty() => {
            Ok(Some(Generation::Delta(message.content)))
        }
        _ => Ok(None),
    }
}

#[async_trait::async_trait]
impl LanguageModel for OllamaLanguageModel {
    async fn generate(
        &self,
        context: &TurnContext,
        cancel: CancellationToken,
    ) -> Result<EngineStream<Generation>> {
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: self.build_messages(context),
            stream: true,
            options: ChatOptions {
                temperature: self.config.temperature,
                num_ctx: self.config.num_ctx,
            },
        };

        info!(
            "Requesting {} reply for turn {} ({} history messages)",
            self.config.model,
            context.turn_id,
            context.history.len()
        );

        let send = self.client.post(&url).json(&request).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("generation cancelled"),
            response = send => response.context("LLM request failed")?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("LLM returned {}: {}", status, body);
            bail!("LLM service returned {}", status);
        }

        let mut bytes = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer = Vec::new();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Generation stream dropped after cancellation");
                        break;
                    }
                    next = bytes.next() => next,
                };

                let Some(chunk) = next else {
                    break;
                };
                let chunk = chunk.context("LLM stream interrupted")?;
                buffer.extend_from_slice(&chunk);

                let mut finished = false;
                for item in drain_lines(&mut buffer) {
                    match item? {
                        Some(Generation::Done) => {
                            yield Generation::Done;
                            finished = true;
                            break;
                        }
                        Some(generation) => yield generation,
                        None => {}
                    }
                }
                if finished {
                    break;
                }
            }
        };

        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
