//! Error taxonomy of the routing core and its JSON-RPC / HTTP mappings.

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::Value;

use mh_mcp_client::protocol::{INTERNAL_ERROR, INVALID_REQUEST};
use mh_mcp_client::{JsonRpcError, JsonRpcResponse, TransportError};

pub const SERVER_NOT_FOUND: i64 = -32001;
pub const SERVER_NOT_RUNNING: i64 = -32002;
pub const CIRCUIT_OPEN: i64 = -32003;
pub const REQUEST_TIMEOUT: i64 = -32004;
pub const RESTART_BUDGET_EXCEEDED: i64 = -32005;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown server '{0}'")]
    NotFound(String),

    #[error("server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("server '{0}' is not running")]
    NotRunning(String),

    #[error("server '{0}' exhausted its restart budget and needs a manual start")]
    RestartBudgetExceeded(String),

    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("server '{server}' did not answer within {}ms", .after.as_millis())]
    Timeout { server: String, after: Duration },

    #[error("server '{0}' exited while the request was in flight")]
    UpstreamProcessCrash(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server '{server}' failed to start: {reason}")]
    StartupFailed { server: String, reason: String },

    #[error("transport error on '{server}': {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("enhancement unavailable: {0}")]
    EnhancementUnavailable(String),
}

/// Whole seconds until retry, rounded up so a client never retries early.
pub fn retry_after_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

impl GatewayError {
    pub fn transport(server: &str, source: TransportError) -> Self {
        match source {
            TransportError::ProcessExited => Self::UpstreamProcessCrash(server.to_owned()),
            source => Self::Transport {
                server: server.to_owned(),
                source,
            },
        }
    }

    /// JSON-RPC error code for the synthesized error envelope.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::NotFound(_) => SERVER_NOT_FOUND,
            Self::NotRunning(_) | Self::UpstreamProcessCrash(_) => SERVER_NOT_RUNNING,
            Self::CircuitOpen { .. } => CIRCUIT_OPEN,
            Self::Timeout { .. } => REQUEST_TIMEOUT,
            Self::RestartBudgetExceeded(_) => RESTART_BUDGET_EXCEEDED,
            Self::InvalidRequest(_) | Self::AlreadyRunning(_) => INVALID_REQUEST,
            Self::StartupFailed { .. } | Self::Transport { .. } | Self::EnhancementUnavailable(_) => {
                INTERNAL_ERROR
            }
        }
    }

    /// HTTP status for the operational endpoints.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning(_) | Self::NotRunning(_) | Self::RestartBudgetExceeded(_) => {
                StatusCode::CONFLICT
            }
            Self::CircuitOpen { .. } | Self::EnhancementUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamProcessCrash(_) | Self::StartupFailed { .. } | Self::Transport { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Build the `{jsonrpc, error: {code, message, data}, id}` envelope.
    pub fn into_response(self, id: Value) -> JsonRpcResponse {
        let mut err = JsonRpcError::new(self.rpc_code(), self.to_string());
        if let Self::CircuitOpen { retry_after, .. } = &self {
            err = err.with_data(serde_json::json!({
                "retry_after": retry_after_secs(*retry_after),
            }));
        }
        JsonRpcResponse::failure(id, err)
    }
}
