//! The one ordered outbound queue of a session and the state it guards
//!
//! Every message, whether a status produced by the session task or a
//! transcript/delta/audio chunk produced by a turn task, goes through
//! `SessionShared`. A producer first reserves queue capacity (waiting at
//! most the backpressure grace period), then takes the state lock, checks
//! that it is still allowed to speak and sends while holding the lock.
//! Queue order therefore matches the order of state changes, and nothing
//! from a cancelled turn can slip in after `stopped`.
//!
//! The terminal messages (`error`, final status, close) normally go through
//! the same queue. When a stalled client left it full they travel on a
//! separate one-shot channel instead, and the receiver delivers them ahead
//! of the queued turn output, which is dropped.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, Permit};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::SessionState;
use super::stats::SessionStats;
use super::status;
use crate::error::{SessionError, SessionResult, CLOSE_NORMAL};
use crate::protocol::{Outbound, OutboundMessage, StatusValue};

#[derive(Debug)]
struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SessionCounters {
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub turns_cancelled: u64,
    pub audio_fragments: u64,
    pub audio_bytes: u64,
    pub protocol_violations: u64,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    active_turn: Option<ActiveTurn>,
    conversation_id: Option<String>,
    lang: String,
    counters: SessionCounters,
    terminal: Option<oneshot::Sender<Vec<Outbound>>>,
}

/// Create the outbound queue of one connection
pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
    let (terminal_tx, terminal_rx) = oneshot::channel();

    (
        OutboundSender {
            queue: queue_tx,
            terminal: terminal_tx,
        },
        OutboundReceiver {
            queue: queue_rx,
            terminal: Some(terminal_rx),
            tail: Vec::new().into_iter(),
            preempted: false,
        },
    )
}

/// Producing end of a session's outbound queue, handed to the session
pub struct OutboundSender {
    queue: mpsc::Sender<Outbound>,
    terminal: oneshot::Sender<Vec<Outbound>>,
}

/// Consuming end of a session's outbound queue, drained by the transport
pub struct OutboundReceiver {
    queue: mpsc::Receiver<Outbound>,
    terminal: Option<oneshot::Receiver<Vec<Outbound>>>,
    tail: std::vec::IntoIter<Outbound>,
    preempted: bool,
}

impl OutboundReceiver {
    /// Next item for the client; `None` once the session is done with it
    pub async fn recv(&mut self) -> Option<Outbound> {
        if let Some(item) = self.tail.next() {
            return Some(item);
        }
        if self.preempted {
            return None;
        }

        let Some(terminal) = self.terminal.as_mut() else {
            return self.queue.recv().await;
        };

        tokio::select! {
            biased;

            tail = terminal => {
                self.terminal = None;
                match tail {
                    Ok(tail) => {
                        self.preempt(tail);
                        self.tail.next()
                    }
                    Err(_) => self.queue.recv().await,
                }
            }

            item = self.queue.recv() => item,
        }
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        if let Some(terminal) = self.terminal.as_mut() {
            match terminal.try_recv() {
                Ok(tail) => {
                    self.terminal = None;
                    self.preempt(tail);
                }
                Err(oneshot::error::TryRecvError::Closed) => self.terminal = None,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }

        if let Some(item) = self.tail.next() {
            return Ok(item);
        }
        if self.preempted {
            return Err(TryRecvError::Disconnected);
        }
        self.queue.try_recv()
    }

    fn preempt(&mut self, tail: Vec<Outbound>) {
        self.preempted = true;
        self.tail = tail.into_iter();
        // Whatever the stalled client never read is dropped with the queue
        self.queue.close();
    }
}

pub(crate) struct SessionShared {
    session_id: String,
    user_id: String,
    started_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    outbound: mpsc::Sender<Outbound>,
    grace: Duration,
    cancel: CancellationToken,
}

impl SessionShared {
    pub fn new(
        session_id: String,
        user_id: String,
        lang: String,
        outbound: OutboundSender,
        grace: Duration,
    ) -> Self {
        Self {
            session_id,
            user_id,
            started_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connected,
                active_turn: None,
                conversation_id: None,
                lang,
                counters: SessionCounters::default(),
                terminal: Some(outbound.terminal),
            }),
            outbound: outbound.queue,
            grace,
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Cancelled once the session reaches a terminal state
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn lang(&self) -> String {
        self.inner.lock().await.lang.clone()
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.inner.lock().await.conversation_id.clone()
    }

    /// Apply a `start`; without an id the next turn opens a new conversation
    pub async fn start_conversation(&self, conversation_id: Option<String>, lang: String) {
        let mut inner = self.inner.lock().await;
        inner.conversation_id = conversation_id;
        inner.lang = lang;
    }

    pub async fn attach_conversation(&self, conversation_id: String) {
        self.inner.lock().await.conversation_id = Some(conversation_id);
    }

    pub async fn update_counters(&self, f: impl FnOnce(&mut SessionCounters)) {
        let mut inner = self.inner.lock().await;
        f(&mut inner.counters);
    }

    async fn reserve(&self) -> SessionResult<Permit<'_, Outbound>> {
        match tokio::time::timeout(self.grace, self.outbound.reserve()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SessionError::ClientDisconnect),
            Err(_) => Err(SessionError::Backpressure(self.grace)),
        }
    }

    /// Session-scoped message (pong, protocol errors)
    pub async fn send(&self, message: OutboundMessage) -> SessionResult<()> {
        let permit = self.reserve().await?;
        let inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return Err(SessionError::Cancelled);
        }
        permit.send(Outbound::Message(message));
        Ok(())
    }

    /// Session-scoped transition, announced when the state changes
    pub async fn transition(&self, to: SessionState) -> SessionResult<SessionState> {
        let permit = self.reserve().await?;
        let mut inner = self.inner.lock().await;
        let from = inner.state.transition(to)?;
        if let Some(message) = status::announce(from, to) {
            permit.send(Outbound::Message(message));
        }
        Ok(from)
    }

    /// Announce the initial `connected` status
    pub async fn announce_connected(&self) -> SessionResult<()> {
        let permit = self.reserve().await?;
        let inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return Err(SessionError::Cancelled);
        }
        permit.send(Outbound::Message(OutboundMessage::status(StatusValue::Connected)));
        Ok(())
    }

    /// `Listening → Thinking` for a new turn
    pub async fn begin_turn(self: &Arc<Self>, turn_id: u64) -> SessionResult<TurnHandle> {
        let permit = self.reserve().await?;
        let mut inner = self.inner.lock().await;

        if inner.active_turn.is_some() {
            return Err(SessionError::ProtocolViolation(
                "a turn is already in flight".to_string(),
            ));
        }

        let from = inner.state.transition(SessionState::Thinking)?;
        let cancel = self.cancel.child_token();
        inner.active_turn = Some(ActiveTurn {
            id: turn_id,
            cancel: cancel.clone(),
        });
        if let Some(message) = status::announce(from, SessionState::Thinking) {
            permit.send(Outbound::Message(message));
        }

        Ok(TurnHandle {
            id: turn_id,
            cancel,
            shared: Arc::clone(self),
        })
    }

    /// Move to `Stopped` or `Error`, cancel the active turn and close
    ///
    /// Returns false when the session had already ended.
    pub async fn terminate(
        &self,
        to: SessionState,
        close_code: u16,
        reason: &str,
        error_message: Option<String>,
    ) -> bool {
        let terminal = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                return false;
            }
            if let Some(turn) = inner.active_turn.take() {
                debug!("Cancelling turn {} of session {}", turn.id, self.session_id);
                turn.cancel.cancel();
                inner.counters.turns_cancelled += 1;
            }
            inner.state = to;
            inner.terminal.take()
        };
        self.cancel.cancel();

        // Nothing else can be queued once the state is terminal
        let mut tail = Vec::new();
        if let Some(message) = error_message {
            tail.push(Outbound::Message(OutboundMessage::error(message)));
        }
        tail.push(Outbound::Message(OutboundMessage::status(status::status_value(to))));
        tail.push(Outbound::Close {
            code: close_code,
            reason: reason.to_string(),
        });

        match self.outbound.try_reserve_many(tail.len()) {
            Ok(permits) => {
                for (permit, item) in permits.zip(tail) {
                    permit.send(item);
                }
            }
            Err(TrySendError::Full(())) => {
                warn!(
                    "Outbound queue of session {} is full, closing ahead of queued output",
                    self.session_id
                );
                if let Some(terminal) = terminal {
                    let _ = terminal.send(tail);
                }
            }
            Err(TrySendError::Closed(())) => {
                debug!(
                    "Session {} ended after its client went away",
                    self.session_id
                );
            }
        }

        true
    }

    /// End the session because of a fatal error
    pub async fn fail(&self, error: &SessionError) -> bool {
        match error {
            SessionError::ClientDisconnect | SessionError::HeartbeatTimeout(_) => {
                self.terminate(SessionState::Stopped, CLOSE_NORMAL, &error.to_string(), None)
                    .await
            }
            _ => {
                self.terminate(
                    SessionState::Error,
                    error.close_code(),
                    &error.to_string(),
                    Some(error.to_string()),
                )
                .await
            }
        }
    }

    async fn turn_send(
        &self,
        turn_id: u64,
        cancel: &CancellationToken,
        message: OutboundMessage,
        to: Option<SessionState>,
    ) -> SessionResult<()> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            permit = self.reserve() => permit?,
        };

        let mut inner = self.inner.lock().await;
        let current = inner.active_turn.as_ref().map(|t| t.id);
        if current != Some(turn_id) || cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        if let Some(to) = to {
            let from = inner.state.transition(to)?;
            if to == SessionState::Listening {
                inner.active_turn = None;
            }
            if status::announce(from, to).is_none() {
                return Ok(());
            }
        }

        permit.send(Outbound::Message(message));
        Ok(())
    }

    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.lock().await;
        let duration = Utc::now().signed_duration_since(self.started_at);

        SessionStats {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            state: inner.state,
            conversation_id: inner.conversation_id.clone(),
            lang: inner.lang.clone(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            active_turn: inner.active_turn.as_ref().map(|t| t.id),
            turns_completed: inner.counters.turns_completed,
            turns_failed: inner.counters.turns_failed,
            turns_cancelled: inner.counters.turns_cancelled,
            audio_fragments: inner.counters.audio_fragments,
            audio_bytes: inner.counters.audio_bytes,
            protocol_violations: inner.counters.protocol_violations,
        }
    }
}

/// A turn's right to speak on the session's outbound queue
///
/// Every send re-checks, under the session lock, that this turn is still
/// the active one; after `stop` or a newer turn all sends fail with
/// `SessionError::Cancelled`.
#[derive(Clone)]
pub struct TurnHandle {
    id: u64,
    cancel: CancellationToken,
    shared: Arc<SessionShared>,
}

impl TurnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    pub fn user_id(&self) -> &str {
        self.shared.user_id()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a message belonging to this turn
    pub async fn emit(&self, message: OutboundMessage) -> SessionResult<()> {
        self.shared.turn_send(self.id, &self.cancel, message, None).await
    }

    /// Transition on behalf of this turn; `Listening` ends the turn
    pub async fn advance(&self, to: SessionState) -> SessionResult<()> {
        let message = OutboundMessage::status(status::status_value(to));
        self.shared
            .turn_send(self.id, &self.cancel, message, Some(to))
            .await
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }
}

#[cfg(test)]
impl TurnHandle {
    /// A turn already in `Thinking`, for exercising coordinators directly
    pub(crate) async fn detached(capacity: usize) -> (TurnHandle, OutboundReceiver) {
        let (tx, rx) = outbound_channel(capacity);
        let shared = Arc::new(SessionShared::new(
            "test-session".to_string(),
            "test-user".to_string(),
            "pt-PT".to_string(),
            tx,
            Duration::from_millis(200),
        ));
        shared.transition(SessionState::Listening).await.unwrap();
        let turn = shared.begin_turn(1).await.unwrap();
        (turn, rx)
    }
}
