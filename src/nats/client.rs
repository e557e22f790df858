use anyhow::{Context, Result};
use async_nats::Client;
use tracing::{debug, info};

use super::messages::AudioFrameMessage;

/// Subject prefix audio frames are published under
pub const AUDIO_SUBJECT_PREFIX: &str = "audio.frame";

/// Transcripts arrive on `stt.text.partial` and `stt.text.final`
pub const TRANSCRIPT_SUBJECT: &str = "stt.text.>";

pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    /// Publish one audio frame of a transcription stream
    pub async fn publish_audio_frame(
        &self,
        stream_id: &str,
        audio: &[u8],
        language: &str,
        sequence: u32,
        is_final: bool,
    ) -> Result<()> {
        let subject = format!("{}.{}", AUDIO_SUBJECT_PREFIX, stream_id);

        let message = AudioFrameMessage::new(stream_id, sequence, audio, language, is_final);

        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish audio frame")?;

        debug!(
            "Published audio frame to {} (seq={}, bytes={}, final={})",
            subject,
            sequence,
            audio.len(),
            is_final
        );

        Ok(())
    }

    /// Subscribe to transcript messages
    ///
    /// Transcripts of every stream share the subject; callers filter by
    /// `stream_id` in the payload.
    pub async fn subscribe_transcripts(&self) -> Result<async_nats::Subscriber> {
        let subscriber = self
            .client
            .subscribe(TRANSCRIPT_SUBJECT)
            .await
            .context("Failed to subscribe to transcripts")?;

        debug!("Subscribed to {}", TRANSCRIPT_SUBJECT);

        Ok(subscriber)
    }
}
