pub mod auth;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod http;
pub mod nats;
pub mod protocol;
pub mod session;

pub use auth::{Authenticator, Credentials, JwtAuthenticator, OpenAuthenticator, UserIdentity};
pub use config::Config;
pub use coordinator::{Engines, Pipeline, StageOutcome};
pub use engine::{
    ConversationStore, HttpSpeechSynthesizer, HttpSpeechToText, InMemoryConversationStore,
    LanguageModel, NatsSpeechToText, OllamaLanguageModel, SpeechSynthesizer, SpeechToText,
};
pub use error::{SessionError, SessionResult};
pub use http::{create_router, AppState};
pub use nats::{AudioFrameMessage, NatsClient, TranscriptMessage};
pub use protocol::{ClientFrame, InboundMessage, Outbound, OutboundMessage, StatusValue};
pub use session::{
    outbound_channel, ConversationSession, OutboundReceiver, OutboundSender, SessionConfig,
    SessionHandle, SessionState, SessionStats,
};
