//! Backend server lifecycle API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::runtime::{GatewayError, ServerState};
use crate::state::AppState;

use super::{api_error, gateway_error};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    let servers = state.registry.list();
    let count = servers.len();
    Json(serde_json::json!({
        "servers": servers,
        "count": count,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/servers/:name
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(view) = state.registry.view(&name) else {
        return api_error(StatusCode::NOT_FOUND, format!("unknown server '{name}'"));
    };
    Json(serde_json::json!({
        "server": view,
        "breaker": state.supervisor.breaker(&name).snapshot(),
        "in_flight": state.supervisor.in_flight(&name),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/servers/:name/{start,stop,restart}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    lifecycle_response(&name, state.supervisor.start(&name).await)
}

pub async fn stop_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    lifecycle_response(&name, state.supervisor.stop(&name).await)
}

pub async fn restart_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    lifecycle_response(&name, state.supervisor.restart(&name).await)
}

fn lifecycle_response(name: &str, result: Result<ServerState, GatewayError>) -> Response {
    match result {
        Ok(server_state) => Json(serde_json::json!({
            "server": name,
            "state": server_state,
        }))
        .into_response(),
        Err(e) => gateway_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/servers/:name/health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn check_health(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.supervisor.health_check(&name).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => gateway_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/servers/reload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Re-read the `[mcp]` section from the config file and apply it.
/// Other sections keep their startup values.
pub async fn reload_servers(State(state): State<AppState>) -> Response {
    let Some(path) = state.config_path.as_deref() else {
        return api_error(StatusCode::BAD_REQUEST, "no config file to reload from");
    };
    let config = match crate::cli::read_config(path) {
        Ok(c) => c,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("{e:#}")),
    };

    match state.supervisor.reconfigure(&config.mcp).await {
        Ok(diff) => {
            tracing::info!(
                added = ?diff.added,
                removed = ?diff.removed,
                changed = ?diff.changed,
                "server registry reloaded"
            );
            Json(diff).into_response()
        }
        Err(issues) => {
            let messages: Vec<String> = issues.iter().map(ToString::to_string).collect();
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "invalid server configuration",
                    "issues": messages,
                })),
            )
                .into_response()
        }
    }
}
