use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use mh_domain::config::Config;
use mh_mcp_client::JsonRpcResponse;

use crate::runtime::{BreakerRegistry, Enhancer, Proxy, ResponseCache, ServerRegistry, Supervisor};

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core**: validated config and where it was loaded from
/// - **Backends**: server registry, supervisor, breakers
/// - **Routing**: response cache, proxy, enhancement middleware
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    /// Path the config was read from; `POST /v1/servers/reload` re-reads it.
    pub config_path: Option<PathBuf>,
    pub started_at: Instant,

    // ── Backends ──────────────────────────────────────────────────────
    pub registry: Arc<ServerRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub supervisor: Arc<Supervisor>,

    // ── Routing ───────────────────────────────────────────────────────
    pub cache: Arc<ResponseCache<JsonRpcResponse>>,
    pub proxy: Arc<Proxy>,
    pub enhancer: Arc<Enhancer>,
}
