//! Axum server setup and router construction.

use std::net::SocketAddr;
use std::sync::Arc;

use arena_rs::coordinator::Arena;
use axum::Router;
use axum::routing::{get, post};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::api::{self, AppState};
use crate::broadcast::WsMessage;
use crate::ws::{self, WsState};

/// Build the full axum router.
///
/// The router serves:
/// - WebSocket event stream at `/ws`
/// - REST API at `/api/*`
pub fn build_router(arena: Arc<Arena>, broadcast_tx: broadcast::Sender<WsMessage>) -> Router {
    let ws_state = WsState {
        arena: arena.clone(),
        broadcast_tx,
    };
    let app_state = AppState { arena };

    // Dashboards are usually served from another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .with_state(ws_state);

    let api_routes = Router::new()
        .route(
            "/api/competitions",
            get(api::list_competitions).post(api::create_competition),
        )
        .route("/api/competitions/{id}", get(api::get_competition))
        .route(
            "/api/competitions/{id}/participants",
            get(api::list_participants).post(api::add_participant),
        )
        .route(
            "/api/competitions/{id}/participants/{pid}",
            get(api::get_participant),
        )
        .route(
            "/api/competitions/{id}/participants/{pid}/status",
            get(api::participant_status),
        )
        .route(
            "/api/competitions/{id}/participants/{pid}/terminate",
            post(api::terminate_participant),
        )
        .route("/api/competitions/{id}/problems", get(api::list_problems))
        .route(
            "/api/competitions/{id}/problems/{pid}",
            get(api::get_problem),
        )
        .route("/api/competitions/{id}/submit", post(api::submit))
        .route(
            "/api/competitions/{id}/submissions",
            get(api::list_submissions),
        )
        .route("/api/competitions/{id}/hints", post(api::request_hint))
        .route("/api/competitions/{id}/rankings", get(api::rankings))
        .route("/api/agent/request", post(api::agent_request))
        .route("/api/system/sandbox-status", get(api::sandbox_status))
        .with_state(app_state);

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind, spawn the server, and return the bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> Result<SocketAddr, String> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
    let addr = listener
        .local_addr()
        .map_err(|e| format!("failed to read bound address: {e}"))?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Server stopped: {e}");
        }
    });

    Ok(addr)
}
