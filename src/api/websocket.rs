//! WebSocket handler for the duplex voice channel
//!
//! Text frames carry JSON control messages, binary frames carry PCM. Each
//! connection owns exactly one session.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::ApiState;
use crate::session::messages::{Outbound, WsIncoming};
use crate::session::{Session, SessionHandle};

/// Capacity of the per-connection outbound queue
const OUTBOUND_BUFFER: usize = 64;

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Encode an outbound item as a WebSocket frame
fn to_frame(item: Outbound) -> Option<Message> {
    match item {
        Outbound::Message(message) => match serde_json::to_string(&message) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                tracing::warn!(error = %e, kind = message.kind(), "failed to encode message");
                None
            }
        },
        Outbound::Audio(pcm) => Some(Message::Binary(pcm.into())),
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, receiver) = socket.split();

    // Channel the session writes to; drained into the socket
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let (session, session_task) =
        Session::spawn(state.services.clone(), state.session_options(), tx);
    let session_id = session.id();

    let open = state.sessions.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(session_id = %session_id, open, "WebSocket connected");

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let Some(frame) = to_frame(item) else {
                continue;
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = state.config.turn.idle_timeout;
    let inbound = session.clone();
    let mut recv_task = tokio::spawn(async move {
        receive(receiver, &inbound, idle_timeout).await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {}
    }

    session.shutdown();
    if let Err(e) = session_task.await {
        tracing::warn!(session_id = %session_id, error = %e, "session task failed");
    }
    send_task.abort();

    let open = state.sessions.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    tracing::info!(session_id = %session_id, open, "WebSocket disconnected");
}

/// Route inbound frames to the session until the peer leaves or goes idle
async fn receive(mut receiver: SplitStream<WebSocket>, session: &SessionHandle, idle: Duration) {
    loop {
        let frame = match tokio::time::timeout(idle, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(idle_secs = idle.as_secs(), "closing idle WebSocket");
                break;
            }
        };

        let delivered = match frame {
            Message::Text(text) => match WsIncoming::parse(text.as_str()) {
                Ok(command) => session.command(command),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed message");
                    true
                }
            },
            Message::Binary(pcm) => session.audio(pcm.to_vec()),
            Message::Ping(data) => {
                // axum answers pings automatically
                tracing::trace!(len = data.len(), "received ping");
                true
            }
            Message::Close(_) => {
                tracing::info!("WebSocket closed by client");
                break;
            }
            Message::Pong(_) => true,
        };

        if !delivered {
            break;
        }
    }
}
