use axum::{
    extract::{Query, State},
    Json,
};
use runcash_protocol::frames::ServerFrame;
use serde::Deserialize;
use std::sync::Arc;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<usize>,
}

/// GET /api/latest-numbers: newest relayed events, newest first, in the
/// same flat shapes the socket and push-stream carry.
pub async fn latest_numbers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LatestQuery>,
) -> Json<Vec<ServerFrame>> {
    let limit = q
        .limit
        .unwrap_or(state.config.server.recent_window)
        .min(state.config.server.recent_window);
    let frames = state
        .broadcaster
        .recent_events(limit)
        .into_iter()
        .map(ServerFrame::from)
        .collect();
    Json(frames)
}
