//! Arena HTTP server.
//!
//! Serves the REST API that external agents call between turns, and a
//! WebSocket event stream at `/ws`.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p arena-web -- --config arena.json
//! cargo run -p arena-web -- --port 8080 --log-level debug
//! ```
//!
//! Competitions found in the configured snapshot directory are loaded at
//! startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arena_rs::prelude::*;
use arena_web::{WebBroadcastHandler, WebConfig, WsMessage, spawn_web};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// HTTP server for arena competitions.
#[derive(Parser)]
#[command(about = "Turn-boundary API and event stream for arena competitions")]
struct Args {
    /// Engine configuration (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: std::net::IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(args.log_level))
        .init();

    let config = match &args.config {
        Some(path) => ArenaConfig::load(path)?,
        None => ArenaConfig::default(),
    };

    let web_config = WebConfig {
        bind_addr: SocketAddr::new(args.host, args.port),
        ..Default::default()
    };
    let (ws_tx, _) = tokio::sync::broadcast::channel::<WsMessage>(web_config.broadcast_capacity);

    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(WebBroadcastHandler::new(ws_tx.clone()));
    let arena = Arena::from_config(config, Arc::new(handler))?;
    let restored = arena.restore().map_err(|e| e.to_string())?;
    if restored > 0 {
        info!("Restored {restored} competitions from snapshots");
    }

    let addr = spawn_web(Arc::new(arena), ws_tx, web_config).await?;
    println!("Arena API: http://{addr}/api");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown: {e}"))?;
    info!("Shutting down");
    Ok(())
}
