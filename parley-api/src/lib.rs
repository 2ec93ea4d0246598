//! HTTP accept layer for the Parley SFU
//!
//! Exposes the signaling WebSocket endpoint and a liveness probe. All
//! meeting logic lives in `parley-sfu`; this crate only bridges sockets
//! into the pool.

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use parley_sfu::{Config, MeetingPool};

pub mod ws;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<MeetingPool>,
    pub config: Arc<Config>,
}

/// Build the router: signaling WebSocket plus health probe
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/health", get(health_check));

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

/// Basic health check (always returns OK if server is running)
async fn health_check() -> impl IntoResponse {
    "OK"
}
