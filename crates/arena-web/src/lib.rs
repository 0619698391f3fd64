//! HTTP surface for arena-rs competitions.
//!
//! `arena-web` serves the turn-boundary REST API that external agents use
//! (submit, buy hints, forward provider calls, read rankings) and a
//! WebSocket stream of engine events for dashboards.
//!
//! # Quick start
//!
//! ```ignore
//! use arena_rs::prelude::*;
//! use arena_web::{WebBroadcastHandler, WebConfig, WsMessage, spawn_web};
//!
//! let (ws_tx, _) = tokio::sync::broadcast::channel::<WsMessage>(256);
//! let handler = CompositeEventHandler::new()
//!     .with(LoggingHandler)
//!     .with(WebBroadcastHandler::new(ws_tx.clone()));
//! let arena = Arc::new(Arena::from_config(config, Arc::new(handler))?);
//!
//! let addr = spawn_web(arena, ws_tx, WebConfig::default()).await?;
//! println!("API: http://{addr}/api");
//! ```
//!
//! # Architecture
//!
//! ```text
//! agents ──REST──▶ api handlers ──▶ Arena ──ArenaEvent──▶ WebBroadcastHandler
//!                                                               │ WsMessage
//!                                          dashboards ◀── /ws ──┘
//! ```

mod api;
pub mod broadcast;
mod server;
mod ws;

pub use broadcast::{WebBroadcastHandler, WsMessage};
pub use server::build_router;

use std::net::SocketAddr;
use std::sync::Arc;

use arena_rs::coordinator::Arena;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:5000`.
    pub bind_addr: SocketAddr,
    /// Capacity of the event broadcast channel. Default: 256.
    ///
    /// Clients that fall behind by this many events receive a fresh
    /// snapshot to resynchronize.
    pub broadcast_capacity: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            broadcast_capacity: 256,
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// `broadcast_tx` must be the sender the arena's [`WebBroadcastHandler`]
/// writes to. The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(
    arena: Arc<Arena>,
    broadcast_tx: tokio::sync::broadcast::Sender<WsMessage>,
    config: WebConfig,
) -> Result<SocketAddr, String> {
    let router = server::build_router(arena, broadcast_tx);
    server::start_server(router, config.bind_addr).await
}
