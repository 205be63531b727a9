//! Session Manager
//!
//! Upgrades `/ws` requests and runs one session per WebSocket: a writer task
//! draining the session's outbound queue into the socket, and a reader task
//! handing every text frame to the relay.
//!
//! A session moves Open → Closing → Closed. Whichever task stops first
//! (client closed, socket error, writer gone) starts the close; the other
//! task is aborted and the hub releases the session's subscriptions.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::protocol::ServerMessage;
use crate::relay::Relay;

/// Lifecycle phase of a session, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

/// WebSocket upgrade handler for `/ws`
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let relay = Arc::clone(&state.relay);
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Run an accepted WebSocket until either side goes away
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sender, mut receiver) = socket.split();
    let hub = Arc::clone(relay.hub());

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let session_id = match hub.register(tx).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected WebSocket session");
            if let Ok(text) = ServerMessage::error(e.to_string()).to_json() {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let greeting = match ServerMessage::connected().to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize greeting");
            hub.unregister(&session_id).await;
            return;
        }
    };
    if sender.send(Message::Text(greeting)).await.is_err() {
        tracing::debug!(session_id = %session_id, "Client left before greeting");
        hub.unregister(&session_id).await;
        return;
    }
    tracing::debug!(session_id = %session_id, phase = ?Phase::Open, "Session phase");

    let writer_id = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_json() {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        tracing::debug!(session_id = %writer_id, "WebSocket send failed");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %writer_id, error = %e, "Failed to serialize message");
                }
            }
        }
    });

    let reader_relay = Arc::clone(&relay);
    let reader_id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(message) => {
                    if !handle_ws_message(&reader_relay, &reader_id, message).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %reader_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::debug!(session_id = %session_id, phase = ?Phase::Closing, "Session phase");
    hub.unregister(&session_id).await;
    tracing::debug!(session_id = %session_id, phase = ?Phase::Closed, "Session phase");
}

/// Handle one received frame
///
/// Returns false if the session should close.
async fn handle_ws_message(relay: &Relay, session_id: &str, message: Message) -> bool {
    match message {
        Message::Text(text) => {
            tracing::debug!(session_id = %session_id, len = text.len(), "Received frame");
            if let Some(reply) = relay.handle_text(session_id, &text).await {
                reply_to(relay, session_id, reply).await;
            }
            true
        }
        Message::Binary(_) => {
            reply_to(relay, session_id, ServerMessage::error("Binary messages not supported")).await;
            true
        }
        // axum answers pings on its own
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(session_id = %session_id, "Client requested close");
            false
        }
    }
}

async fn reply_to(relay: &Relay, session_id: &str, message: ServerMessage) {
    if let Err(e) = relay.hub().send_to(session_id, message).await {
        tracing::debug!(session_id = %session_id, error = %e, "Reply dropped");
    }
}
