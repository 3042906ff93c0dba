//! mcphub gateway: routes JSON-RPC calls from many clients to supervised
//! MCP backend processes behind a single HTTP endpoint.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
