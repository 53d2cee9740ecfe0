use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gitSha": env!("RUNCASH_GIT_SHA"),
        "storeConnected": state.store.is_connected(),
        "connections": state.broadcaster.connection_count(),
        "topics": state.broadcaster.topic_count(),
        "published": state.broadcaster.published_count(),
    }))
}

/// GET /socket-status: whether the poller holds a usable store connection.
pub async fn socket_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "storeConnected": state.store.is_connected(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
