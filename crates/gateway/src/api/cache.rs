use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /v1/cache/stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

/// `POST /v1/cache/clear`
pub async fn clear(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.cache.clear();
    tracing::info!(cleared, "response cache cleared");
    Json(serde_json::json!({ "cleared": cleared }))
}
