use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::engine::Transcript;

/// Audio published for the NATS transcription service
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    /// Identifies one transcription request (one turn)
    pub stream_id: String,
    pub sequence: u32,
    /// Base64-encoded audio bytes
    pub audio: String,
    /// Primary language subtag, e.g. "pt"
    pub language: String,
    pub timestamp: String, // RFC3339 timestamp
    /// Closes the stream; carries no audio
    #[serde(rename = "final")]
    pub final_frame: bool,
}

impl AudioFrameMessage {
    pub fn new(
        stream_id: &str,
        sequence: u32,
        audio: &[u8],
        language: &str,
        final_frame: bool,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            sequence,
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
            language: language.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            final_frame,
        }
    }
}

/// Transcript published back by the transcription service
#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub stream_id: String,
    pub text: String,
    pub partial: bool,
    pub timestamp: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl TranscriptMessage {
    /// Decode a payload, keeping it only if it belongs to `stream_id`
    ///
    /// Every stream shares the transcript subjects, so foreign and
    /// unreadable payloads are expected and skipped.
    pub fn for_stream(payload: &[u8], stream_id: &str) -> Option<Self> {
        serde_json::from_slice::<Self>(payload)
            .ok()
            .filter(|message| message.stream_id == stream_id)
    }

    pub fn into_transcript(self) -> Transcript {
        if self.partial {
            Transcript::Partial(self.text)
        } else {
            Transcript::Final(self.text.trim().to_string())
        }
    }
}
