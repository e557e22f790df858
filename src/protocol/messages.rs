use base64::Engine;
use serde::{Deserialize, Serialize};

/// Language used when a `start` message does not carry one
pub const DEFAULT_LANG: &str = "pt-PT";

/// Control and audio messages sent by the client as JSON text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Begin (or restart) a conversation cycle
    Start {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        lang: Option<String>,
    },
    /// End the session
    Stop,
    /// Keepalive, answered with `pong`
    Ping,
    /// The user finished speaking
    EndOfTurn,
    /// Audio fragment with an explicit sequence number
    Audio {
        seq: u64,
        data_b64: String,
    },
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Status values, a projection of the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusValue {
    Connected,
    Listening,
    Thinking,
    Speaking,
    Error,
    Stopped,
}

/// Events sent to the client as JSON text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Status { value: StatusValue },
    PartialTranscript { text: String },
    FinalTranscript { text: String },
    LlmTextDelta { text: String },
    LlmTextFinal { text: String },
    TtsAudioChunk {
        format: String,
        seq: u64,
        data_b64: String,
    },
    Error { message: String },
    Pong,
}

impl OutboundMessage {
    pub fn status(value: StatusValue) -> Self {
        OutboundMessage::Status { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    pub fn audio_chunk(format: impl Into<String>, seq: u64, payload: &[u8]) -> Self {
        OutboundMessage::TtsAudioChunk {
            format: format.into(),
            seq,
            data_b64: base64::engine::general_purpose::STANDARD.encode(payload),
        }
    }

    /// Wire `type` tag, handy for logging and assertions
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Status { .. } => "status",
            OutboundMessage::PartialTranscript { .. } => "partial_transcript",
            OutboundMessage::FinalTranscript { .. } => "final_transcript",
            OutboundMessage::LlmTextDelta { .. } => "llm_text_delta",
            OutboundMessage::LlmTextFinal { .. } => "llm_text_final",
            OutboundMessage::TtsAudioChunk { .. } => "tts_audio_chunk",
            OutboundMessage::Error { .. } => "error",
            OutboundMessage::Pong => "pong",
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Everything the per-connection writer forwards to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(OutboundMessage),
    /// Close the transport; nothing is written after this
    Close { code: u16, reason: String },
}

/// Frames handed from the transport reader to a session
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// JSON text frame, parsed by the session
    Text(String),
    /// Binary audio fragment, sequenced in arrival order
    Binary(Vec<u8>),
    /// Transport-level keepalive (WebSocket pong)
    Keepalive,
    /// The transport closed
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_fields() {
        let msg = InboundMessage::parse(
            r#"{"type": "start", "conversation_id": "abc", "lang": "pt-PT"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Start {
                conversation_id: Some("abc".to_string()),
                lang: Some("pt-PT".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_start_without_fields() {
        let msg = InboundMessage::parse(r#"{"type": "start"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Start {
                conversation_id: None,
                lang: None,
            }
        );
    }

    #[test]
    fn test_parse_simple_controls() {
        assert_eq!(InboundMessage::parse(r#"{"type":"stop"}"#).unwrap(), InboundMessage::Stop);
        assert_eq!(InboundMessage::parse(r#"{"type":"ping"}"#).unwrap(), InboundMessage::Ping);
        assert_eq!(
            InboundMessage::parse(r#"{"type":"end_of_turn"}"#).unwrap(),
            InboundMessage::EndOfTurn
        );
    }

    #[test]
    fn test_parse_unknown_type_fails() {
        assert!(InboundMessage::parse(r#"{"type":"dance"}"#).is_err());
        assert!(InboundMessage::parse("not json").is_err());
    }

    #[test]
    fn test_outbound_tags() {
        let json = OutboundMessage::status(StatusValue::Listening).to_json();
        assert_eq!(json, r#"{"type":"status","value":"listening"}"#);

        let json = OutboundMessage::LlmTextDelta {
            text: "Olá".to_string(),
        }
        .to_json();
        assert_eq!(json, r#"{"type":"llm_text_delta","text":"Olá"}"#);

        assert_eq!(OutboundMessage::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_audio_chunk_is_base64() {
        let msg = OutboundMessage::audio_chunk("audio/wav", 3, &[1, 2, 3]);
        let json = msg.to_json();
        assert!(json.contains(r#""type":"tts_audio_chunk""#));
        assert!(json.contains(r#""format":"audio/wav""#));
        assert!(json.contains(r#""seq":3"#));
        assert!(json.contains(r#""data_b64":"AQID""#));
        assert_eq!(msg.kind(), "tts_audio_chunk");
    }
}
