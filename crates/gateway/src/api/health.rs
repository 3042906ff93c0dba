use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::runtime::ServerStatus;
use crate::state::AppState;

/// `GET /v1/health`: the hub is up. Backend health is reported, not required.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let servers = state.registry.list();
    let count = |status: ServerStatus| servers.iter().filter(|s| s.state.status == status).count();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "servers": {
            "total": servers.len(),
            "running": count(ServerStatus::Running),
            "degraded": count(ServerStatus::Degraded),
            "failed": count(ServerStatus::Failed),
        },
    }))
}
