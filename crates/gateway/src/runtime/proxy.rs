//! JSON-RPC proxy: routes one client request to its backend.
//!
//! Order of checks per call: server known and not Failed, cache, server
//! running, duplicate in-flight id, circuit breaker, then the timed
//! backend call. A Failed server serves nothing, cached or not, until an
//! operator starts it again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use mh_domain::config::{CacheConfig, ProxyConfig};
use mh_mcp_client::{JsonRpcRequest, JsonRpcResponse};

use super::cache::{cache_key, ResponseCache};
use super::error::GatewayError;
use super::registry::ServerStatus;
use super::supervisor::Supervisor;

/// Per-call knobs supplied by the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    pub bypass_cache: bool,
    pub timeout_ms: Option<u64>,
}

type InFlightKey = (String, String, String);

pub struct Proxy {
    supervisor: Arc<Supervisor>,
    cache: Arc<ResponseCache<JsonRpcResponse>>,
    cache_config: CacheConfig,
    proxy_config: ProxyConfig,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

/// Releases a client's (server, client, id) claim when the call ends.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl Proxy {
    pub fn new(
        supervisor: Arc<Supervisor>,
        cache: Arc<ResponseCache<JsonRpcResponse>>,
        cache_config: CacheConfig,
        proxy_config: ProxyConfig,
    ) -> Self {
        Self {
            supervisor,
            cache,
            cache_config,
            proxy_config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache<JsonRpcResponse>> {
        &self.cache
    }

    /// Forward `req` from `client` to `server` and return the backend's
    /// response carrying the client's original id.
    pub async fn forward(
        &self,
        server: &str,
        client: &str,
        req: JsonRpcRequest,
        opts: ForwardOptions,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let entry = self
            .supervisor
            .registry()
            .get(server)
            .ok_or_else(|| GatewayError::NotFound(server.to_owned()))?;
        if entry.status() == ServerStatus::Failed {
            return Err(GatewayError::RestartBudgetExceeded(server.to_owned()));
        }

        let cacheable = self.cache_config.is_cacheable(&req.method);
        let key = cacheable.then(|| cache_key(server, &req.method, req.params.as_ref()));
        if let (Some(key), false) = (&key, opts.bypass_cache) {
            if let Some(hit) = self.cache.get(key) {
                tracing::debug!(server = %server, method = %req.method, "cache hit");
                return Ok(hit.with_id(req.id));
            }
        }

        let conn = self.supervisor.connection(server)?;
        let _claim = self.claim(server, client, &req)?;

        let breaker = self.supervisor.breaker(server);
        let admission = breaker.check().map_err(|open| GatewayError::CircuitOpen {
            name: server.to_owned(),
            retry_after: open.retry_after,
        })?;

        let timeout = self.proxy_config.call_timeout(opts.timeout_ms);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, conn.request(&req.method, req.params.clone())).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let resp = match outcome {
            Ok(Ok(resp)) => {
                breaker.record_success(admission);
                resp
            }
            Ok(Err(e)) => {
                breaker.record_failure(admission);
                tracing::warn!(server = %server, method = %req.method, error = %e, "backend call failed");
                return Err(GatewayError::transport(server, e));
            }
            Err(_) => {
                breaker.record_failure(admission);
                tracing::warn!(
                    server = %server,
                    method = %req.method,
                    timeout_ms = timeout.as_millis() as u64,
                    "backend call timed out"
                );
                return Err(GatewayError::Timeout {
                    server: server.to_owned(),
                    after: timeout,
                });
            }
        };

        tracing::debug!(
            server = %server,
            client = %client,
            method = %req.method,
            elapsed_ms,
            is_error = resp.is_error(),
            "proxied request"
        );

        if let Some(key) = key {
            if !resp.is_error() {
                self.cache.set(key, resp.clone());
            }
        }
        Ok(resp.with_id(req.id))
    }

    /// Forward a notification; nothing comes back.
    pub async fn notify(
        &self,
        server: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let conn = self.supervisor.connection(server)?;
        conn.notify(method, params)
            .await
            .map_err(|e| GatewayError::transport(server, e))
    }

    /// Default timeout for proxied calls without an override.
    pub fn default_timeout(&self) -> Duration {
        self.proxy_config.call_timeout(None)
    }

    fn claim(&self, server: &str, client: &str, req: &JsonRpcRequest) -> Result<InFlightGuard, GatewayError> {
        let key = (server.to_owned(), client.to_owned(), req.id.to_string());
        if !self.in_flight.lock().insert(key.clone()) {
            return Err(GatewayError::InvalidRequest(format!(
                "request id {} is already in flight for client '{client}'",
                req.id
            )));
        }
        Ok(InFlightGuard {
            set: self.in_flight.clone(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::breaker::BreakerRegistry;
    use crate::runtime::registry::ServerRegistry;
    use mh_domain::config::{BreakerConfig, McpConfig, McpServerConfig, SupervisorConfig};

    fn proxy() -> Proxy {
        let mcp = McpConfig {
            servers: [("fs".to_string(), McpServerConfig::stdio("fs-server", &[]))]
                .into_iter()
                .collect(),
        };
        let registry = Arc::new(ServerRegistry::from_config(&mcp).unwrap());
        let supervisor = Arc::new(Supervisor::new(
            registry,
            Arc::new(BreakerRegistry::new()),
            SupervisorConfig::default(),
            BreakerConfig::default(),
        ));
        Proxy::new(
            supervisor,
            Arc::new(ResponseCache::new(16, None)),
            CacheConfig::default(),
            ProxyConfig::default(),
        )
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let p = proxy();
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let err = p.forward("nope", "c", req, ForwardOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn stopped_server_is_not_running() {
        let p = proxy();
        let req = JsonRpcRequest::new(1, "tools/call", None);
        let err = p.forward("fs", "c", req, ForwardOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotRunning(_)));
    }

    #[tokio::test]
    async fn cached_listing_served_while_stopped_with_client_id() {
        let p = proxy();
        let key = cache_key("fs", "tools/list", None);
        p.cache.set(key, JsonRpcResponse::success(serde_json::json!(7), serde_json::json!({"tools": []})));

        let req = JsonRpcRequest::new("client-abc", "tools/list", None);
        let resp = p.forward("fs", "c", req.clone(), ForwardOptions::default()).await.unwrap();
        assert_eq!(resp.id, serde_json::json!("client-abc"));

        let bypass = ForwardOptions {
            bypass_cache: true,
            ..Default::default()
        };
        assert!(p.forward("fs", "c", req, bypass).await.is_err());
    }

    #[tokio::test]
    async fn failed_server_does_not_serve_cached_listings() {
        let p = proxy();
        let key = cache_key("fs", "tools/list", None);
        p.cache.set(key, JsonRpcResponse::success(serde_json::json!(7), serde_json::json!({"tools": []})));

        let entry = p.supervisor.registry().get("fs").unwrap();
        assert!(entry.transition(ServerStatus::Starting, None));
        assert!(entry.transition(ServerStatus::Failed, Some("gave up".into())));

        let req = JsonRpcRequest::new(1, "tools/list", None);
        let err = p.forward("fs", "c", req, ForwardOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RestartBudgetExceeded(_)));
        assert_eq!(p.cache.stats().hits, 0);
    }

    #[test]
    fn duplicate_claims_are_rejected_until_released() {
        let p = proxy();
        let req = JsonRpcRequest::new(5, "tools/call", None);
        let first = p.claim("fs", "alice", &req).unwrap();
        assert!(matches!(p.claim("fs", "alice", &req), Err(GatewayError::InvalidRequest(_))));
        // Other clients and other servers are independent.
        let _bob = p.claim("fs", "bob", &req).unwrap();
        let _git = p.claim("git", "alice", &req).unwrap();
        drop(first);
        assert!(p.claim("fs", "alice", &req).is_ok());
    }
}
