//! MCP configuration types, re-exported from `mh-domain`.
//!
//! The canonical definitions live in `mh_domain::config` so that the
//! hub's config deserializer can include them without depending on
//! the full MCP client crate.

pub use mh_domain::config::{McpConfig, McpServerConfig, McpTransportKind};
