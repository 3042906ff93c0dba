//! `mh-mcp-client`: stdio plumbing between mcphub and its MCP backends.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types shared by the hub and its backends.
//! - A [`ProcessHandle`] that owns a backend child process.
//! - A multiplexed stdio transport that correlates responses by id, so many
//!   requests can be in flight on one connection.
//! - An [`McpConnection`] that performs the MCP handshake and health probes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mh_mcp_client::{McpConnection, McpServerConfig};
//!
//! let cfg = McpServerConfig::stdio("npx", &["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]);
//! let conn = McpConnection::spawn("filesystem", &cfg)?;
//! conn.initialize(Duration::from_secs(10)).await?;
//! let tools = conn.request("tools/list", None).await?;
//! ```

pub mod config;
pub mod connection;
pub mod process;
pub mod protocol;
pub mod transport;

// Re-exports for convenience.
pub use config::{McpConfig, McpServerConfig, McpTransportKind};
pub use connection::McpConnection;
pub use process::{ProcessExit, ProcessHandle};
pub use protocol::{ClientMessage, JsonRpcEnvelope, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use transport::{McpTransport, TransportError};
