// Shared harness for session integration tests
//
// Scripted engines stand in for the speech-to-text, language model and
// synthesis services, and `Harness` drives one ConversationSession through
// its frame channel while collecting everything it queues for the client.

#![allow(dead_code)]

use anyhow::anyhow;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voice_gateway::engine::{
    EngineStream, Generation, SynthesizedAudio, Transcript, TurnContext,
};
use voice_gateway::{
    outbound_channel, ClientFrame, ConversationSession, Engines, InMemoryConversationStore,
    LanguageModel, Outbound, OutboundMessage, OutboundReceiver, Pipeline, SessionConfig,
    SessionHandle, SessionStats, SpeechSynthesizer, SpeechToText, StatusValue, UserIdentity,
};

// ============================================================================
// Scripted engines
// ============================================================================

/// Speech-to-text that answers every call with the same script
#[derive(Default)]
pub struct ScriptedStt {
    pub partials: Vec<String>,
    /// `None` makes every call fail
    pub final_text: Option<String>,
    /// (audio, lang) of every call
    pub calls: Mutex<Vec<(Vec<u8>, String)>>,
}

impl ScriptedStt {
    pub fn saying(text: &str) -> Self {
        Self {
            partials: vec![text.split(' ').next().unwrap_or(text).to_string()],
            final_text: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(Vec<u8>, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        lang: &str,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EngineStream<Transcript>> {
        self.calls.lock().unwrap().push((audio, lang.to_string()));

        let Some(final_text) = self.final_text.clone() else {
            return Err(anyhow!("stt service unreachable"));
        };

        let mut items: Vec<anyhow::Result<Transcript>> = self
            .partials
            .iter()
            .cloned()
            .map(|p| Ok(Transcript::Partial(p)))
            .collect();
        items.push(Ok(Transcript::Final(final_text)));
        Ok(stream::iter(items).boxed())
    }

    fn name(&self) -> &str {
        "scripted-stt"
    }
}

/// Language model streaming fixed deltas
#[derive(Default)]
pub struct ScriptedLlm {
    pub deltas: Vec<String>,
    /// Fail instead of producing the delta at this index (or `Done`)
    pub fail_at: Option<usize>,
    /// Wait for the gate before producing the delta at this index
    pub gate: Option<(usize, Arc<Notify>)>,
    pub contexts: Mutex<Vec<TurnContext>>,
}

impl ScriptedLlm {
    pub fn replying(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn contexts(&self) -> Vec<TurnContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate(
        &self,
        context: &TurnContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EngineStream<Generation>> {
        self.contexts.lock().unwrap().push(context.clone());

        let deltas = self.deltas.clone();
        let fail_at = self.fail_at;
        let gate = self.gate.clone();

        let stream = async_stream::stream! {
            for index in 0..=deltas.len() {
                if let Some((at, gate)) = &gate {
                    if *at == index {
                        gate.notified().await;
                    }
                }
                if fail_at == Some(index) {
                    yield Err(anyhow!("connection reset by model server"));
                    break;
                }
                match deltas.get(index) {
                    Some(delta) => {
                        yield Ok(Generation::Delta(delta.clone()));
                    }
                    None => {
                        yield Ok(Generation::Done);
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "scripted-llm"
    }
}

/// Synthesis producing `chunks_per_call` small chunks per call
pub struct ScriptedTts {
    pub chunks_per_call: usize,
    pub fail: bool,
    /// Wait for the gate before producing the chunk at this index
    pub gate: Option<(usize, Arc<Notify>)>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedTts {
    pub fn new(chunks_per_call: usize) -> Self {
        Self {
            chunks_per_call,
            fail: false,
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for ScriptedTts {
    async fn synthesize(
        &self,
        text: &str,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EngineStream<SynthesizedAudio>> {
        self.calls.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(anyhow!("tts service returned 503"));
        }

        let chunks = self.chunks_per_call;
        let gate = self.gate.clone();

        let stream = async_stream::stream! {
            for index in 0..chunks {
                if let Some((at, gate)) = &gate {
                    if *at == index {
                        gate.notified().await;
                    }
                }
                yield Ok::<_, anyhow::Error>(SynthesizedAudio {
                    format: "audio/wav".to_string(),
                    payload: vec![index as u8; 8],
                });
            }
        };

        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "scripted-tts"
    }
}

pub fn engines(stt: Arc<ScriptedStt>, llm: Arc<ScriptedLlm>, tts: Arc<ScriptedTts>) -> Engines {
    Engines {
        stt,
        llm,
        tts,
        store: Arc::new(InMemoryConversationStore::new()),
    }
}

/// Session settings suited to tests: short timeouts, every byte counts
pub fn test_config() -> SessionConfig {
    SessionConfig {
        silence_timeout_ms: 60_000,
        min_turn_bytes: 1,
        backpressure_grace_ms: 2_000,
        transcription_timeout_ms: 2_000,
        generation_timeout_ms: 2_000,
        synthesis_timeout_ms: 2_000,
        ..SessionConfig::default()
    }
}

// ============================================================================
// Session harness
// ============================================================================

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub handle: SessionHandle,
    pub outbound: OutboundReceiver,
    pub task: JoinHandle<SessionStats>,
}

impl Harness {
    pub fn start(engines: Engines, config: SessionConfig) -> Self {
        let pipeline = Arc::new(Pipeline::new(engines, &config));
        let (outbound_tx, outbound) = outbound_channel(config.outbound_capacity);
        let (session, handle) = ConversationSession::new(
            config,
            UserIdentity {
                user_id: "tester".to_string(),
            },
            pipeline,
            outbound_tx,
        );

        let task = tokio::spawn(session.run());
        Self {
            handle,
            outbound,
            task,
        }
    }

    pub async fn send_json(&self, value: serde_json::Value) {
        self.handle
            .send(ClientFrame::Text(value.to_string()))
            .await
            .expect("session should accept frames");
    }

    pub async fn send_audio(&self, bytes: &[u8]) {
        self.handle
            .send(ClientFrame::Binary(bytes.to_vec()))
            .await
            .expect("session should accept frames");
    }

    pub async fn next(&mut self) -> Outbound {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("outbound queue closed")
    }

    pub async fn next_message(&mut self) -> OutboundMessage {
        match self.next().await {
            Outbound::Message(message) => message,
            Outbound::Close { code, reason } => {
                panic!("unexpected close {}: {}", code, reason)
            }
        }
    }

    pub async fn expect_status(&mut self, value: StatusValue) {
        assert_eq!(self.next_message().await, OutboundMessage::status(value));
    }

    /// Collect messages up to and including the given status
    pub async fn until_status(&mut self, value: StatusValue) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.next_message().await;
            let done = message == OutboundMessage::status(value);
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    /// Collect messages up to and including the first of the given kind
    pub async fn until_kind(&mut self, kind: &str) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.next_message().await;
            let done = message.kind() == kind;
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    /// `start` and wait for `listening`
    pub async fn open(&mut self, lang: &str) {
        self.expect_status(StatusValue::Connected).await;
        self.send_json(serde_json::json!({"type": "start", "lang": lang}))
            .await;
        self.expect_status(StatusValue::Listening).await;
    }

    /// Wait for the session to end, returning what was still queued
    pub async fn finish(mut self) -> (Vec<Outbound>, SessionStats) {
        let stats = tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked");

        let mut rest = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            rest.push(item);
        }
        (rest, stats)
    }
}

pub fn kinds(messages: &[OutboundMessage]) -> Vec<&'static str> {
    messages.iter().map(|m| m.kind()).collect()
}
