use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::SessionConfig;
use super::heartbeat::HeartbeatMonitor;
use super::ingest::AudioIngestBuffer;
use super::outbound::{OutboundSender, SessionShared};
use super::state::SessionState;
use super::stats::SessionStats;
use super::turn::{self, TurnOutcome};
use crate::auth::UserIdentity;
use crate::coordinator::Pipeline;
use crate::error::{SessionError, SessionResult, CLOSE_NORMAL};
use crate::protocol::{ClientFrame, InboundMessage, OutboundMessage, DEFAULT_LANG};

/// Inbound frames buffered between the transport reader and the session task
const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndOfTurn {
    /// `end_of_turn` from the client
    Explicit,
    /// Silence or fragment-count threshold
    Automatic,
}

/// One client connection's conversation
///
/// The session task drains inbound frames and owns the ingest buffer, the
/// heartbeat and the silence timer. Each turn runs as its own task so that
/// `stop` and `ping` are handled while external calls are in flight.
pub struct ConversationSession {
    config: SessionConfig,
    pipeline: Arc<Pipeline>,
    shared: Arc<SessionShared>,
    frames: mpsc::Receiver<ClientFrame>,
    ingest: AudioIngestBuffer,
    heartbeat: HeartbeatMonitor,
    silence_deadline: Option<Instant>,
    next_turn_id: u64,
    turn_task: Option<(u64, JoinHandle<()>)>,
    turn_done_tx: mpsc::UnboundedSender<(u64, TurnOutcome)>,
    turn_done_rx: mpsc::UnboundedReceiver<(u64, TurnOutcome)>,
    consecutive_violations: u32,
}

impl ConversationSession {
    /// Create a session for an authenticated connection
    ///
    /// `outbound` is the connection's single ordered queue; the transport
    /// writer drains it. The returned handle feeds inbound frames.
    pub fn new(
        config: SessionConfig,
        identity: UserIdentity,
        pipeline: Arc<Pipeline>,
        outbound: OutboundSender,
    ) -> (Self, SessionHandle) {
        let session_id = Uuid::new_v4().to_string();
        info!(
            "Creating conversation session {} for user {}",
            session_id, identity.user_id
        );

        let shared = Arc::new(SessionShared::new(
            session_id.clone(),
            identity.user_id,
            DEFAULT_LANG.to_string(),
            outbound,
            config.backpressure_grace(),
        ));

        let (frames_tx, frames_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (turn_done_tx, turn_done_rx) = mpsc::unbounded_channel();

        let session = Self {
            heartbeat: HeartbeatMonitor::new(config.heartbeat_window()),
            config,
            pipeline,
            shared: Arc::clone(&shared),
            frames: frames_rx,
            ingest: AudioIngestBuffer::new(),
            silence_deadline: None,
            next_turn_id: 1,
            turn_task: None,
            turn_done_tx,
            turn_done_rx,
            consecutive_violations: 0,
        };

        let handle = SessionHandle {
            session_id,
            frames: frames_tx,
            shared,
        };

        (session, handle)
    }

    /// Drive the session until it stops, returning its final statistics
    pub async fn run(mut self) -> SessionStats {
        if let Err(e) = self.shared.announce_connected().await {
            self.shared.fail(&e).await;
            return self.finish().await;
        }

        loop {
            let silence_deadline = self.silence_deadline;

            tokio::select! {
                biased;

                _ = self.shared.cancel_token().cancelled() => break,

                frame = self.frames.recv() => {
                    let frame = frame.unwrap_or(ClientFrame::Closed);
                    self.heartbeat.touch();
                    if let Err(e) = self.handle_frame(frame).await {
                        self.escalate(e).await;
                    }
                }

                Some((turn_id, outcome)) = self.turn_done_rx.recv() => {
                    if let Err(e) = self.on_turn_done(turn_id, outcome).await {
                        self.escalate(e).await;
                    }
                }

                _ = tokio::time::sleep_until(self.heartbeat.deadline()) => {
                    warn!(
                        "Session {}: no keepalive for {:?}",
                        self.shared.session_id(),
                        self.heartbeat.window()
                    );
                    self.shared
                        .fail(&SessionError::HeartbeatTimeout(self.heartbeat.window()))
                        .await;
                }

                _ = sleep_until_some(silence_deadline) => {
                    self.silence_deadline = None;
                    debug!("Session {}: silence timeout", self.shared.session_id());
                    if let Err(e) = self.end_turn(EndOfTurn::Automatic).await {
                        self.escalate(e).await;
                    }
                }
            }
        }

        self.finish().await
    }

    async fn handle_frame(&mut self, frame: ClientFrame) -> SessionResult<()> {
        match frame {
            ClientFrame::Text(text) => match InboundMessage::parse(&text) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => self.violation(format!("invalid message: {}", e)).await,
            },
            ClientFrame::Binary(bytes) => self.accept_audio(None, bytes).await,
            ClientFrame::Keepalive => Ok(()),
            ClientFrame::Closed => {
                info!("Session {}: client disconnected", self.shared.session_id());
                self.shared.fail(&SessionError::ClientDisconnect).await;
                Ok(())
            }
        }
    }

    async fn handle_message(&mut self, message: InboundMessage) -> SessionResult<()> {
        match message {
            InboundMessage::Start {
                conversation_id,
                lang,
            } => self.start(conversation_id, lang).await,
            InboundMessage::Stop => {
                info!("Session {}: stop requested", self.shared.session_id());
                self.shared
                    .terminate(SessionState::Stopped, CLOSE_NORMAL, "stopped", None)
                    .await;
                Ok(())
            }
            InboundMessage::Ping => {
                self.consecutive_violations = 0;
                self.shared.send(OutboundMessage::Pong).await
            }
            InboundMessage::EndOfTurn => self.end_turn(EndOfTurn::Explicit).await,
            InboundMessage::Audio { seq, data_b64 } => {
                match base64::engine::general_purpose::STANDARD.decode(data_b64.as_bytes()) {
                    Ok(bytes) => self.accept_audio(Some(seq), bytes).await,
                    Err(e) => self.violation(format!("audio {} is not base64: {}", seq, e)).await,
                }
            }
        }
    }

    async fn start(&mut self, conversation_id: Option<String>, lang: Option<String>) -> SessionResult<()> {
        let state = self.shared.state().await;
        if state.turn_in_flight() {
            return self
                .violation("start rejected: a turn is in progress".to_string())
                .await;
        }

        let lang = lang
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LANG.to_string());
        info!(
            "Session {}: start (conversation={:?}, lang={})",
            self.shared.session_id(),
            conversation_id,
            lang
        );

        self.consecutive_violations = 0;
        self.shared.start_conversation(conversation_id, lang).await;

        // A restart discards whatever was buffered for the abandoned turn
        self.ingest.clear();
        self.silence_deadline = None;

        self.shared.transition(SessionState::Listening).await?;
        Ok(())
    }

    async fn accept_audio(&mut self, seq: Option<u64>, bytes: Vec<u8>) -> SessionResult<()> {
        let state = self.shared.state().await;
        if state == SessionState::Connected {
            return self.violation("audio before start".to_string()).await;
        }
        if state.is_terminal() {
            return Ok(());
        }
        if state.turn_in_flight() {
            // Also keeps the assistant's own playback out of the next turn
            debug!(
                "Session {}: dropping {} bytes of audio received while {}",
                self.shared.session_id(),
                bytes.len(),
                state
            );
            return Ok(());
        }

        let len = bytes.len() as u64;
        if let Err(e) = self.ingest.push(seq, bytes) {
            return self.violation(e.to_string()).await;
        }

        self.consecutive_violations = 0;
        self.shared
            .update_counters(|c| {
                c.audio_fragments += 1;
                c.audio_bytes += len;
            })
            .await;

        self.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
        if self.fragment_threshold_reached() {
            return self.end_turn(EndOfTurn::Automatic).await;
        }

        Ok(())
    }

    fn fragment_threshold_reached(&self) -> bool {
        self.config
            .end_of_turn_after_fragments
            .map_or(false, |n| n > 0 && self.ingest.len() >= n)
    }

    async fn end_turn(&mut self, trigger: EndOfTurn) -> SessionResult<()> {
        let state = self.shared.state().await;
        if state != SessionState::Listening {
            if trigger == EndOfTurn::Explicit {
                return self
                    .violation(format!("end_of_turn while {}", state))
                    .await;
            }
            return Ok(());
        }

        self.silence_deadline = None;

        if self.ingest.is_empty() || self.ingest.buffered_bytes() < self.config.min_turn_bytes {
            let buffered = self.ingest.buffered_bytes();
            self.ingest.clear();
            return match trigger {
                EndOfTurn::Explicit => {
                    self.consecutive_violations = 0;
                    self.shared
                        .send(OutboundMessage::error(format!(
                            "not enough audio to transcribe ({} bytes)",
                            buffered
                        )))
                        .await
                }
                EndOfTurn::Automatic => {
                    warn!(
                        "Session {}: discarding {} bytes of audio, below the minimum turn size",
                        self.shared.session_id(),
                        buffered
                    );
                    Ok(())
                }
            };
        }

        let turn_id = self.next_turn_id;
        let handle = self.shared.begin_turn(turn_id).await?;
        self.next_turn_id += 1;
        self.consecutive_violations = 0;

        // Nothing is read from the client between begin_turn and take
        let audio = self.ingest.take();
        info!(
            "Session {}: turn {} started with {} bytes",
            self.shared.session_id(),
            turn_id,
            audio.len()
        );

        let pipeline = Arc::clone(&self.pipeline);
        let done = self.turn_done_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = turn::run(&pipeline, &handle, audio).await;
            handle
                .shared()
                .update_counters(|c| outcome.record(c))
                .await;
            let _ = done.send((handle.id(), outcome));
        });
        // A previous turn that already returned to listening is left to finish
        self.turn_task = Some((turn_id, task));

        Ok(())
    }

    async fn on_turn_done(&mut self, turn_id: u64, outcome: TurnOutcome) -> SessionResult<()> {
        if matches!(&self.turn_task, Some((id, _)) if *id == turn_id) {
            if let Some((_, task)) = self.turn_task.take() {
                if let Err(e) = task.await {
                    error!("Turn {} task panicked: {}", turn_id, e);
                }
            }
        }

        debug!("Session {}: turn {} ended: {:?}", self.shared.session_id(), turn_id, outcome);

        if let TurnOutcome::Fatal(e) = outcome {
            return Err(e);
        }

        if !self.ingest.is_empty() && self.shared.state().await == SessionState::Listening {
            if self.fragment_threshold_reached() {
                return self.end_turn(EndOfTurn::Automatic).await;
            }
            self.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
        }

        Ok(())
    }

    /// Report a protocol violation, closing the session when they pile up
    async fn violation(&mut self, message: String) -> SessionResult<()> {
        self.consecutive_violations += 1;
        self.shared.update_counters(|c| c.protocol_violations += 1).await;

        let error = SessionError::ProtocolViolation(message);
        warn!("Session {}: {}", self.shared.session_id(), error);

        if self.consecutive_violations > self.config.max_protocol_violations {
            self.shared.fail(&error).await;
            return Ok(());
        }

        self.shared.send(OutboundMessage::error(error.to_string())).await
    }

    async fn escalate(&self, error: SessionError) {
        match error {
            // The session already ended
            SessionError::Cancelled => {}
            e => {
                error!("Session {}: {}", self.shared.session_id(), e);
                self.shared.fail(&e).await;
            }
        }
    }

    async fn finish(mut self) -> SessionStats {
        if let Some((turn_id, task)) = self.turn_task.take() {
            if let Err(e) = task.await {
                error!("Turn {} task panicked: {}", turn_id, e);
            }
        }

        let stats = self.shared.stats().await;
        info!(
            "Session {} ended in state {} after {:.1}s ({} turns completed, {} failed, {} cancelled)",
            stats.session_id,
            stats.state,
            stats.duration_secs,
            stats.turns_completed,
            stats.turns_failed,
            stats.turns_cancelled
        );
        stats
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Gateway-side handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    frames: mpsc::Sender<ClientFrame>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        self.shared.user_id()
    }

    /// Hand an inbound frame to the session task
    pub async fn send(&self, frame: ClientFrame) -> SessionResult<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| SessionError::ClientDisconnect)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel_token().is_cancelled()
    }

    pub async fn stats(&self) -> SessionStats {
        self.shared.stats().await
    }

    /// Administrative stop, same effect as a client `stop`
    pub async fn stop(&self) -> bool {
        self.shared
            .terminate(SessionState::Stopped, CLOSE_NORMAL, "stopped by gateway", None)
            .await
    }
}
