//! Shared fixtures: tiny `sh` backends speaking line-delimited JSON-RPC.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mh_domain::config::{Config, McpServerConfig};
use mh_gateway::bootstrap;
use mh_gateway::state::AppState;

/// Extracts the numeric wire id of a request line into `$id`.
const READ_ID: &str = r#"id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')"#;

/// Answers every request with `{"n": <count of requests so far>}`.
pub fn counter_server() -> String {
    format!(
        r#"n=0
while IFS= read -r line; do
  {READ_ID}
  if [ -n "$id" ]; then
    n=$((n+1))
    printf '{{"jsonrpc":"2.0","id":%s,"result":{{"n":%s}}}}\n' "$id" "$n"
  fi
done"#
    )
}

/// Answers every request with the raw request line as `result.request`.
pub fn echo_line_server() -> String {
    format!(
        r#"while IFS= read -r line; do
  {READ_ID}
  if [ -n "$id" ]; then
    printf '{{"jsonrpc":"2.0","id":%s,"result":{{"request":%s}}}}\n' "$id" "$line"
  fi
done"#
    )
}

/// Completes the handshake, then swallows everything.
pub fn hang_after_handshake() -> String {
    format!(
        r#"IFS= read -r line
{READ_ID}
printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id"
cat > /dev/null"#
    )
}

/// Completes the handshake and exits as soon as the client says initialized.
pub fn crash_after_handshake() -> String {
    format!(
        r#"IFS= read -r line
{READ_ID}
printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id"
IFS= read -r line
exit 1"#
    )
}

/// Completes the handshake and exits on the first proxied request.
pub fn crash_on_request() -> String {
    format!(
        r#"IFS= read -r line
{READ_ID}
printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id"
IFS= read -r line
IFS= read -r line
exit 1"#
    )
}

/// A stdio backend running `script` under `sh`, without periodic probes.
pub fn sh(script: &str) -> McpServerConfig {
    let mut cfg = McpServerConfig::stdio("sh", &["-c", script]);
    cfg.health_check_interval_secs = 0;
    cfg
}

/// Config with fast supervisor timings for tests.
pub fn config(servers: Vec<(&str, McpServerConfig)>) -> Config {
    let mut cfg = Config::default();
    cfg.supervisor.startup_timeout_ms = 5_000;
    cfg.supervisor.stop_grace_ms = 500;
    cfg.supervisor.restart_delay_ms = 20;
    cfg.supervisor.health_timeout_ms = 1_000;
    for (name, server) in servers {
        cfg.mcp.servers.insert(name.to_owned(), server);
    }
    cfg
}

pub fn state(cfg: Config) -> AppState {
    bootstrap::build_app_state(Arc::new(cfg), None).unwrap()
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
