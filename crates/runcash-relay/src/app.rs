use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use runcash_core::config::RelayConfig;
use runcash_store::SharedStore;
use tower_http::cors::CorsLayer;

use crate::ws::broadcast::Broadcaster;

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub broadcaster: Arc<Broadcaster>,
    /// Same link the poller reads through; its liveness is the status probe.
    pub store: Arc<dyn SharedStore>,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        broadcaster: Arc<Broadcaster>,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        Self {
            config,
            broadcaster,
            store,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/socket-status", get(crate::http::health::socket_status))
        .route("/api/status", get(crate::http::health::socket_status))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route("/api/events", get(crate::http::stream::events_handler))
        .route("/api/latest-numbers", get(crate::http::polling::latest_numbers))
        .route("/api/roulettes", get(crate::http::games::list_games))
        .route("/api/numbers/{game_name}", get(crate::http::games::game_numbers))
        .route(
            "/api/numbers/byid/{game_id}",
            get(crate::http::games::game_numbers_by_id),
        )
        .route("/emit-event", post(crate::http::ingest::emit_event))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
