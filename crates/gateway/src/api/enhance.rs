//! Standalone prompt enhancement.
//!
//! - `POST /v1/enhance`: `{prompt, bypass_cache}` in, outcome out
//! - `GET /v1/enhance/stats`: counters, cache stats and breaker state

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use super::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EnhanceRequest {
    pub prompt: String,
    #[serde(default)]
    pub bypass_cache: bool,
}

pub async fn enhance(State(state): State<AppState>, Json(req): Json<EnhanceRequest>) -> Response {
    if req.prompt.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "prompt must not be empty");
    }
    let outcome = state.enhancer.enhance(&req.prompt, req.bypass_cache).await;
    Json(outcome).into_response()
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.enhancer.stats())
}
