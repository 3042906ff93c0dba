//! Backend (MCP server) registry configuration.
//!
//! These are lightweight config structs used to deserialize the `[mcp]`
//! section. Process lifecycle lives in the gateway's supervisor; the wire
//! protocol lives in the `mh-mcp-client` crate.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level MCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// Backend definitions keyed by their unique server name.
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// Declarative configuration for a single backend.
///
/// Immutable once loaded; the registry swaps whole values on an explicit
/// reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    /// The command to spawn (e.g. `"npx"`).
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides applied on top of the hub's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Transport type (`"stdio"` or `"sse"`).
    #[serde(default)]
    pub transport: McpTransportKind,

    /// Optional URL for SSE transport.
    #[serde(default)]
    pub url: Option<String>,

    /// Start the backend when the hub boots.
    #[serde(default = "d_true")]
    pub auto_start: bool,

    /// Relaunch the backend when it exits unexpectedly.
    #[serde(default = "d_true")]
    pub restart_on_failure: bool,

    /// Automatic restarts allowed before the server is marked failed.
    #[serde(default = "d_3")]
    pub max_restarts: u32,

    /// Seconds between periodic health checks (`0` disables them).
    #[serde(default = "d_30")]
    pub health_check_interval_secs: u64,
}

impl McpServerConfig {
    /// Minimal stdio config for `command args...` with every other field defaulted.
    pub fn stdio(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            env: HashMap::new(),
            transport: McpTransportKind::Stdio,
            url: None,
            auto_start: true,
            restart_on_failure: true,
            max_restarts: 3,
            health_check_interval_secs: 30,
        }
    }

    /// Periodic health check interval, `None` when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

/// Transport kind for connecting to an MCP server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_30() -> u64 {
    30
}
