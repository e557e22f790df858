use anyhow::{bail, Result};
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{primary_language, EngineStream, SpeechToText, Transcript};
use crate::nats::{NatsClient, TranscriptMessage};

/// Size of the audio frames published per turn
const FRAME_BYTES: usize = 32 * 1024;

/// Speech-to-text through a NATS transcription service
///
/// Each turn becomes its own stream id: the audio is published as a series
/// of frames closed by an empty final frame, and transcripts for that
/// stream id are relayed until the first non-partial one.
pub struct NatsSpeechToText {
    client: Arc<NatsClient>,
}

impl NatsSpeechToText {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = NatsClient::connect(url).await?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait::async_trait]
impl SpeechToText for NatsSpeechToText {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        lang: &str,
        cancel: CancellationToken,
    ) -> Result<EngineStream<Transcript>> {
        let stream_id = format!("turn-{}", uuid::Uuid::new_v4());
        let language = primary_language(lang).to_string();

        // Subscribe before publishing so no transcript can be missed
        let mut subscriber = self.client.subscribe_transcripts().await?;

        let mut sequence = 0u32;
        for frame in audio.chunks(FRAME_BYTES) {
            if cancel.is_cancelled() {
                bail!("transcription cancelled");
            }
            self.client
                .publish_audio_frame(&stream_id, frame, &language, sequence, false)
                .await?;
            sequence += 1;
        }
        self.client
            .publish_audio_frame(&stream_id, &[], &language, sequence, true)
            .await?;

        info!(
            "Published {} bytes as {} frames for {}",
            audio.len(),
            sequence,
            stream_id
        );

        let stream = async_stream::try_stream! {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => None,
                    msg = subscriber.next() => msg,
                };

                let Some(msg) = msg else {
                    Err::<(), _>(anyhow::anyhow!("transcript subscription closed for {}", stream_id))?;
                    break;
                };

                let Some(message) = TranscriptMessage::for_stream(&msg.payload, &stream_id) else {
                    continue;
                };

                match message.into_transcript() {
                    Transcript::Partial(text) => yield Transcript::Partial(text),
                    Transcript::Final(text) => {
                        yield Transcript::Final(text);
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "nats-stt"
    }
}
