//! Tandem Server
//!
//! Thin HTTP/WebSocket façade over the Manager. This is a library crate -
//! the server is started via `start_server()`. No orchestration logic
//! lives here: routes translate requests into Manager calls, and the
//! WebSocket feed relays event-bus traffic outward.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, routing::post, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tandem_core::{EventBus, Manager};

pub mod error;
pub mod routes;
pub mod ws;

/// Configuration for starting the server.
pub struct ServerConfig {
    /// Port to listen on (default: 3000).
    pub port: u16,
    /// Default working directory for new tasks.
    pub working_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub bus: Arc<EventBus>,
    pub working_dir: PathBuf,
}

/// Build the router for an already-booted manager.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/tasks", post(routes::create_task))
        .route("/api/tasks/:id", get(routes::get_task))
        .route("/api/tasks/:id/input", post(routes::enqueue_input))
        .route("/api/tasks/:id/terminate", post(routes::terminate_task))
        .route("/api/mcp", get(routes::mcp_status))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process ends.
pub async fn start_server(manager: Arc<Manager>, config: ServerConfig) -> Result<()> {
    let state = AppState {
        bus: manager.bus(),
        manager,
        working_dir: config.working_dir,
    };
    let router = build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!(%addr, "tandem server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
