//! WebSocket transport for conversation sessions
//!
//! Each connection gets a reader task feeding `ClientFrame`s to the session,
//! a writer task draining the session's outbound queue (and sending
//! transport pings), and the session task itself.

use super::state::AppState;
use crate::auth::Credentials;
use crate::protocol::{ClientFrame, Outbound, OutboundMessage};
use crate::session::{outbound_channel, ConversationSession, OutboundReceiver, SessionHandle};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Close reasons are limited to 123 bytes by the WebSocket protocol
const MAX_CLOSE_REASON: usize = 120;

/// GET /ws/voice?token=...
pub async fn voice_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(credentials): Query<Credentials>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state, credentials))
}

async fn serve_connection(socket: WebSocket, state: AppState, credentials: Credentials) {
    let (mut sink, stream) = socket.split();

    let identity = match state.authenticator.authenticate(&credentials).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejecting voice connection: {}", e);
            let _ = sink
                .send(Message::Text(OutboundMessage::error(e.to_string()).to_json()))
                .await;
            let _ = sink.send(close_message(e.close_code(), &e.to_string())).await;
            return;
        }
    };

    let config = state.session_config.clone();
    let (outbound_tx, outbound_rx) = outbound_channel(config.outbound_capacity);
    let (session, handle) = ConversationSession::new(
        config.clone(),
        identity,
        Arc::clone(&state.pipeline),
        outbound_tx,
    );

    let session_id = handle.id().to_string();
    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), handle.clone());
    info!("Voice connection accepted as session {}", session_id);

    let mut writer = tokio::spawn(write_outbound(sink, outbound_rx, config.ping_interval()));
    let reader = tokio::spawn(read_inbound(stream, handle));

    let stats = session.run().await;

    reader.abort();
    if tokio::time::timeout(config.backpressure_grace(), &mut writer)
        .await
        .is_err()
    {
        warn!("Session {}: writer did not finish, aborting", session_id);
        writer.abort();
    }

    state.sessions.write().await.remove(&session_id);
    info!(
        "Session {} closed ({} turns completed)",
        session_id, stats.turns_completed
    );
}

async fn read_inbound(mut stream: SplitStream<WebSocket>, session: SessionHandle) {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => ClientFrame::Text(text),
            Ok(Message::Binary(bytes)) => ClientFrame::Binary(bytes),
            // Pings are answered by the transport itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => ClientFrame::Keepalive,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("Session {}: read error: {}", session.id(), e);
                break;
            }
        };

        if session.send(frame).await.is_err() {
            return;
        }
    }

    let _ = session.send(ClientFrame::Closed).await;
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: OutboundReceiver,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Message(message)) => {
                    if sink.send(Message::Text(message.to_json())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, &reason)).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

fn close_message(code: u16, reason: &str) -> Message {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    Message::Close(Some(CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    }))
}
