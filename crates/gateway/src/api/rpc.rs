//! `POST /v1/rpc/:server`: the JSON-RPC entry point.
//!
//! Requests always answer HTTP 200 with either the backend's response or a
//! synthesized error envelope. Notifications (no `id`) answer 202.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::Value;

use mh_mcp_client::protocol::PARSE_ERROR;
use mh_mcp_client::{ClientMessage, JsonRpcEnvelope, JsonRpcError, JsonRpcResponse};

use super::gateway_error;
use crate::runtime::{EnhanceOutcome, ForwardOptions};
use crate::state::AppState;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const ENHANCED_HEADER: &str = "x-mcphub-enhanced";
const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Default, Deserialize)]
pub struct RpcQuery {
    #[serde(default)]
    pub bypass_cache: bool,
    /// Explicit enhancement opt-in (`true`) or opt-out (`false`).
    #[serde(default)]
    pub enhance: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub async fn rpc(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<RpcQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope: JsonRpcEnvelope = match serde_json::from_slice(&body) {
        Ok(env) => env,
        Err(e) => {
            let err = JsonRpcError::new(PARSE_ERROR, format!("invalid JSON-RPC body: {e}"));
            return Json(JsonRpcResponse::failure(Value::Null, err)).into_response();
        }
    };
    let envelope_id = envelope.id.clone().unwrap_or(Value::Null);

    let mut req = match envelope.into_message() {
        Ok(ClientMessage::Request(req)) => req,
        Ok(ClientMessage::Notification(note)) => {
            return match state.proxy.notify(&server, &note.method, note.params).await {
                Ok(()) => StatusCode::ACCEPTED.into_response(),
                Err(e) => gateway_error(e),
            };
        }
        Err(err) => return Json(JsonRpcResponse::failure(envelope_id, err)).into_response(),
    };

    let client = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_owned();

    let mut enhanced = None;
    if state.enhancer.should_enhance(&req.method, query.enhance, body.len()) {
        enhanced = state.enhancer.apply(&mut req, query.bypass_cache).await;
    }

    let id = req.id.clone();
    let opts = ForwardOptions {
        bypass_cache: query.bypass_cache,
        timeout_ms: query.timeout_ms,
    };
    let resp = match state.proxy.forward(&server, &client, req, opts).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(server = %server, client = %client, error = %e, "request rejected");
            e.into_response(id)
        }
    };

    let mut response = Json(resp).into_response();
    if let Some(value) = enhanced.as_ref().and_then(enhancement_header) {
        response.headers_mut().insert(ENHANCED_HEADER, value);
    }
    response
}

/// Compact metadata for the response header. Prompt text stays out of it.
fn enhancement_header(outcome: &EnhanceOutcome) -> Option<HeaderValue> {
    let meta = serde_json::json!({
        "was_enhanced": outcome.was_enhanced,
        "cached": outcome.cached,
        "model": outcome.model,
        "error": outcome.error,
        "elapsed_ms": outcome.elapsed_ms,
    });
    HeaderValue::from_str(&meta.to_string()).ok()
}
