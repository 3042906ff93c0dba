pub mod breakers;
pub mod cache;
pub mod enhance;
pub mod health;
pub mod rpc;
pub mod servers;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::runtime::GatewayError;
use crate::state::AppState;

/// Build the full API router. State is attached by the caller with
/// `.with_state(...)` after the middleware layers.
pub fn router() -> Router<AppState> {
    Router::new()
        // Liveness
        .route("/v1/health", get(health::health))
        // JSON-RPC proxy
        .route("/v1/rpc/:server", post(rpc::rpc))
        // Backend servers
        .route("/v1/servers", get(servers::list_servers))
        .route("/v1/servers/reload", post(servers::reload_servers))
        .route("/v1/servers/:name", get(servers::get_server))
        .route("/v1/servers/:name/start", post(servers::start_server))
        .route("/v1/servers/:name/stop", post(servers::stop_server))
        .route("/v1/servers/:name/restart", post(servers::restart_server))
        .route("/v1/servers/:name/health", post(servers::check_health))
        // Circuit breakers
        .route("/v1/breakers", get(breakers::list_breakers))
        .route("/v1/breakers/:name", get(breakers::get_breaker))
        .route("/v1/breakers/:name/reset", post(breakers::reset_breaker))
        // Response cache
        .route("/v1/cache/stats", get(cache::stats))
        .route("/v1/cache/clear", post(cache::clear))
        // Prompt enhancement
        .route("/v1/enhance", post(enhance::enhance))
        .route("/v1/enhance/stats", get(enhance::stats))
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub(crate) fn gateway_error(err: GatewayError) -> Response {
    api_error(err.http_status(), err.to_string())
}
