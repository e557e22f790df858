use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{primary_language, EngineStream, SpeechToText, Transcript};

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: String,
}

/// Speech-to-text service reached over HTTP
///
/// Uploads the whole turn as a multipart `file` to
/// `{base_url}/stt/transcribe?language=<lang>` and expects `{"text": ...}`.
/// The service has no incremental output, so only a final transcript is
/// produced.
pub struct HttpSpeechToText {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSpeechToText {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build STT HTTP client")?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    async fn request(&self, audio: Vec<u8>, language: String) -> Result<String> {
        let url = format!("{}/stt/transcribe", self.base_url.trim_end_matches('/'));
        info!(
            "Sending {} bytes to STT at {} (language={})",
            audio.len(),
            url,
            language
        );

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.webm")
            .mime_str("audio/webm")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .query(&[("language", language.as_str())])
            .multipart(form)
            .send()
            .await
            .context("STT request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("STT returned {}: {}", status, body);
            bail!("STT service returned {}", status);
        }

        let body: TranscribeResponse = response
            .json()
            .await
            .context("STT returned an unreadable body")?;

        Ok(body.text.trim().to_string())
    }
}

#[async_trait::async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        lang: &str,
        cancel: CancellationToken,
    ) -> Result<EngineStream<Transcript>> {
        let text = tokio::select! {
            _ = cancel.cancelled() => bail!("transcription cancelled"),
            result = self.request(audio, primary_language(lang).to_string()) => result?,
        };

        Ok(stream::once(async move { Ok(Transcript::Final(text)) }).boxed())
    }

    fn name(&self) -> &str {
        "http-stt"
    }
}
