use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use super::api_error;
use crate::state::AppState;

/// `GET /v1/breakers`
pub async fn list_breakers(State(state): State<AppState>) -> impl IntoResponse {
    let breakers = state.breakers.list();
    let count = breakers.len();
    Json(serde_json::json!({
        "breakers": breakers,
        "count": count,
    }))
}

/// `GET /v1/breakers/:name`
pub async fn get_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.breakers.get(&name) {
        Some(breaker) => Json(breaker.snapshot()).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("no breaker named '{name}'")),
    }
}

/// `POST /v1/breakers/:name/reset`: force the circuit closed.
pub async fn reset_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if !state.breakers.reset(&name) {
        return api_error(StatusCode::NOT_FOUND, format!("no breaker named '{name}'"));
    }
    tracing::info!(breaker = %name, "breaker reset via API");
    match state.breakers.get(&name) {
        Some(breaker) => Json(breaker.snapshot()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
