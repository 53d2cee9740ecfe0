use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use runcash_core::{OutcomeEvent, RelayError};
use runcash_store::GameSummary;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

const MAX_NUMBERS: usize = 100;

type ApiError = (StatusCode, Json<Value>);

fn unavailable(e: runcash_store::StoreError) -> ApiError {
    let e = RelayError::from(e);
    warn!(error = %e, "store read failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": e.code(), "message": e.to_string()})),
    )
}

/// GET /api/roulettes: every known game.
pub async fn list_games(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<GameSummary>>, ApiError> {
    state.store.games().map(Json).map_err(unavailable)
}

#[derive(Debug, Deserialize)]
pub struct NumbersQuery {
    pub limit: Option<usize>,
}

/// GET /api/numbers/{game_name}?limit=: newest outcomes of one game.
pub async fn game_numbers(
    State(state): State<Arc<AppState>>,
    Path(game_name): Path<String>,
    Query(q): Query<NumbersQuery>,
) -> Result<Json<Vec<OutcomeEvent>>, ApiError> {
    let limit = clamp_limit(q.limit, state.config.server.history_limit);
    let rows = state
        .store
        .recent_for_game(&game_name, limit)
        .map_err(unavailable)?;
    Ok(Json(rows.iter().filter_map(|r| r.to_event()).collect()))
}

/// GET /api/numbers/byid/{game_id}?limit=: same read keyed by the stable id.
pub async fn game_numbers_by_id(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
    Query(q): Query<NumbersQuery>,
) -> Result<Json<Vec<OutcomeEvent>>, ApiError> {
    let limit = clamp_limit(q.limit, state.config.server.history_limit);
    let rows = state
        .store
        .recent_for_game_id(&game_id, limit)
        .map_err(unavailable)?;
    Ok(Json(rows.iter().filter_map(|r| r.to_event()).collect()))
}

fn clamp_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_NUMBERS)
}
