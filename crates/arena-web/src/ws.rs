//! WebSocket upgrade handler.
//!
//! Each connected client receives:
//! 1. A [`WsMessage::Snapshot`] listing known competitions on connect.
//! 2. Engine events as they fire.
//!
//! The channel is read-only; anything a client sends is ignored until it
//! closes the socket.

use std::sync::Arc;

use arena_rs::coordinator::Arena;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::broadcast::WsMessage;

/// Shared state for WebSocket handlers.
#[derive(Clone)]
pub struct WsState {
    pub arena: Arc<Arena>,
    pub broadcast_tx: broadcast::Sender<WsMessage>,
}

/// GET /ws
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ws_state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ws_state))
}

async fn handle_socket(socket: WebSocket, ws_state: WsState) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe before the snapshot so nothing falls between the two.
    let mut broadcast_rx = ws_state.broadcast_tx.subscribe();

    if ws_send(&mut sink, &snapshot(&ws_state.arena)).await.is_err() {
        return;
    }
    debug!("WebSocket client connected");

    let arena = ws_state.arena.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(msg) => {
                    if ws_send(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WebSocket client lagged by {n} events, resending snapshot");
                    if ws_send(&mut sink, &snapshot(&arena)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    debug!("WebSocket client disconnected");
    forward_task.abort();
}

fn snapshot(arena: &Arena) -> WsMessage {
    WsMessage::Snapshot {
        competitions: arena.competition_ids(),
    }
}

async fn ws_send(sink: &mut SplitSink<WebSocket, Message>, msg: &WsMessage) -> Result<(), ()> {
    let json = serde_json::to_string(msg).unwrap_or_default();
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}
