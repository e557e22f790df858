use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{EngineStream, SpeechSynthesizer, SynthesizedAudio};
use crate::config::TtsConfig;

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
}

/// Piper-style synthesis service: `POST {"text": ...}` returns audio bytes
///
/// The reply is split into fixed-size chunks so clients can start playback
/// before the whole payload has crossed the socket.
pub struct HttpSpeechSynthesizer {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build TTS HTTP client")?;

        Ok(Self { config, client })
    }

    async fn request(&self, text: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&SpeechRequest { text })
            .send()
            .await
            .context("TTS request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("TTS returned {}: {}", status, body);
            bail!("TTS service returned {}", status);
        }

        let audio = response.bytes().await.context("TTS body interrupted")?;
        Ok(audio.to_vec())
    }
}

/// Split a payload into chunks of at most `chunk_bytes`
pub fn split_audio(format: &str, audio: &[u8], chunk_bytes: usize) -> Vec<SynthesizedAudio> {
    audio
        .chunks(chunk_bytes.max(1))
        .map(|chunk| SynthesizedAudio {
            format: format.to_string(),
            payload: chunk.to_vec(),
        })
        .collect()
}

#[async_trait::async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<EngineStream<SynthesizedAudio>> {
        let audio = tokio::select! {
            _ = cancel.cancelled() => bail!("synthesis cancelled"),
            audio = self.request(text) => audio?,
        };

        if audio.is_empty() {
            bail!("TTS service returned no audio");
        }

        info!(
            "Synthesized {} chars into {} bytes of {}",
            text.chars().count(),
            audio.len(),
            self.config.format
        );

        let chunks = split_audio(&self.config.format, &audio, self.config.chunk_bytes);
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    fn name(&self) -> &str {
        "http-tts"
    }
}
