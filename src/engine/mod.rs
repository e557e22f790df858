//! External collaborators consumed by the session core
//!
//! Speech-to-text, language-model generation, speech synthesis and the
//! conversation history store are all slow, independently failing
//! services. Each is reached through a trait so sessions can be driven by
//! real backends or by scripted ones in tests:
//! - `SpeechToText` - zero or more partials, then exactly one final
//! - `LanguageModel` - ordered deltas, then `Done`
//! - `SpeechSynthesizer` - audio in playback order; end of stream = drained
//! - `ConversationStore` - read-only history plus best-effort appends

mod http_stt;
mod http_tts;
mod memory_store;
mod nats_stt;
mod ollama;

pub use http_stt::HttpSpeechToText;
pub use http_tts::HttpSpeechSynthesizer;
pub use memory_store::InMemoryConversationStore;
pub use nats_stt::NatsSpeechToText;
pub use ollama::OllamaLanguageModel;

use anyhow::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Output of an engine call; the stream ends when the call is finished
pub type EngineStream<T> = BoxStream<'static, Result<T>>;

/// Transcription engine output
#[derive(Debug, Clone, PartialEq)]
pub enum Transcript {
    Partial(String),
    Final(String),
}

/// Generation engine output
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    Delta(String),
    /// Terminal marker; nothing follows it
    Done,
}

/// One piece of synthesized speech
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// MIME type, e.g. `audio/wav`
    pub format: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

/// Everything a language model needs to answer one turn
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub turn_id: u64,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub lang: String,
    /// Final transcript of the user's speech
    pub transcript: String,
    /// Prior exchanges, oldest first
    pub history: Vec<ChatMessage>,
}

#[async_trait::async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one turn's audio
    ///
    /// The stream yields any number of partials and must end with exactly
    /// one final transcript, or an error.
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        lang: &str,
        cancel: CancellationToken,
    ) -> Result<EngineStream<Transcript>>;

    fn name(&self) -> &str;
}

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stream a reply; must end with `Generation::Done` or an error
    async fn generate(
        &self,
        context: &TurnContext,
        cancel: CancellationToken,
    ) -> Result<EngineStream<Generation>>;

    fn name(&self) -> &str;
}

#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`; stream end means all audio has been produced
    async fn synthesize(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<EngineStream<SynthesizedAudio>>;

    fn name(&self) -> &str;
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Start a new conversation for `user_id`, returning its identifier
    async fn create_conversation(&self, user_id: &str) -> Result<String>;

    /// Prior messages of a conversation, oldest first
    async fn history(&self, user_id: &str, conversation_id: &str) -> Result<Vec<ChatMessage>>;

    /// Record one user/assistant exchange
    async fn append_exchange(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()>;
}

/// Reduce a BCP-47 tag to its primary language subtag (`pt-PT` → `pt`)
pub fn primary_language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}
