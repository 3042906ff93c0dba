//! A live connection to one MCP server: transport plus handshake.

use std::time::Duration;

use serde_json::Value;

use mh_domain::config::{McpServerConfig, McpTransportKind};

use crate::process::ProcessExit;
use crate::protocol::{self, JsonRpcResponse};
use crate::transport::{McpTransport, StdioTransport, TransportError};

/// Handle to a launched backend. Owned by the supervisor; everything
/// else reaches the backend through [`McpConnection::request`].
pub struct McpConnection {
    server: String,
    transport: Box<dyn McpTransport>,
}

impl McpConnection {
    /// Launch the backend described by `config`.
    pub fn spawn(server: &str, config: &McpServerConfig) -> Result<Self, TransportError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(server, config)?),
            McpTransportKind::Sse => {
                return Err(TransportError::Unsupported(
                    "SSE transport is not yet implemented".into(),
                ))
            }
        };
        Ok(Self::with_transport(server, transport))
    }

    /// Wrap an already-running transport.
    pub fn with_transport(server: &str, transport: Box<dyn McpTransport>) -> Self {
        Self {
            server: server.to_owned(),
            transport,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Perform the MCP handshake: `initialize` then `notifications/initialized`.
    ///
    /// Returns the server's `initialize` result (capabilities, server info).
    pub async fn initialize(&self, timeout: Duration) -> Result<Value, TransportError> {
        let params = serde_json::to_value(protocol::initialize_params())?;

        let resp = tokio::time::timeout(timeout, self.transport.send_request("initialize", Some(params)))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let result = resp
            .into_result()
            .map_err(|e| TransportError::Protocol(format!("initialize failed: {e}")))?;

        tracing::debug!(server = %self.server, "MCP initialize response received");

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;

        Ok(result)
    }

    /// Liveness probe. Any response, including a JSON-RPC error such as
    /// "method not found", proves the server is reading and answering.
    pub async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        tokio::time::timeout(timeout, self.transport.send_request("ping", None))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(())
    }

    /// Send a request and wait for its correlated response (no timeout).
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        self.transport.send_request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.transport.send_notification(method, params).await
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Resolves once the backend has gone away.
    pub async fn closed(&self) {
        self.transport.closed().await
    }

    pub fn in_flight(&self) -> usize {
        self.transport.in_flight()
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Gracefully shut down the backend.
    pub async fn shutdown(&self, grace: Duration) -> Option<ProcessExit> {
        tracing::info!(server = %self.server, "shutting down MCP server");
        self.transport.shutdown(grace).await
    }
}
