//! AppState construction and background-task spawning extracted from `main.rs`.
//!
//! `serve` and the one-shot CLI commands share [`build_app_state`] so they
//! see exactly the same wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use mh_domain::config::{self, Config, ConfigSeverity, ENHANCEMENT_BREAKER};

use crate::runtime::{BreakerRegistry, Enhancer, Proxy, ResponseCache, ServerRegistry, Supervisor};
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`]. No backend is started here; see [`spawn_background_tasks`].
pub fn build_app_state(config: Arc<Config>, config_path: Option<PathBuf>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if config::has_errors(&issues) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Server registry ──────────────────────────────────────────────
    let registry = Arc::new(ServerRegistry::from_config(&config.mcp).map_err(|errs| {
        let joined = errs.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        anyhow::anyhow!("invalid server registry: {joined}")
    })?);
    if registry.is_empty() {
        tracing::info!("no MCP servers configured");
    } else {
        tracing::info!(servers = registry.len(), names = ?registry.names(), "server registry ready");
    }

    // ── Breakers + supervisor ────────────────────────────────────────
    let breakers = Arc::new(BreakerRegistry::new());
    let supervisor = Arc::new(Supervisor::new(
        registry.clone(),
        breakers.clone(),
        config.supervisor.clone(),
        config.breaker,
    ));
    tracing::info!(
        failure_threshold = config.breaker.failure_threshold,
        recovery_timeout_secs = config.breaker.recovery_timeout_secs,
        "supervisor ready"
    );

    // ── Response cache + proxy ───────────────────────────────────────
    let cache = Arc::new(ResponseCache::new(config.cache.max_size, config.cache.ttl()));
    let proxy = Arc::new(Proxy::new(
        supervisor.clone(),
        cache.clone(),
        config.cache.clone(),
        config.proxy.clone(),
    ));
    tracing::info!(
        enabled = config.cache.enabled,
        max_size = config.cache.max_size,
        ttl_secs = ?config.cache.ttl_secs,
        "response cache ready"
    );

    // ── Enhancement middleware ───────────────────────────────────────
    let enhance_breaker = breakers.get_or_create(ENHANCEMENT_BREAKER, config.enhance.breaker);
    let enhancer = Arc::new(Enhancer::from_config(config.enhance.clone(), enhance_breaker));

    Ok(AppState {
        config,
        config_path,
        started_at: Instant::now(),
        registry,
        breakers,
        supervisor,
        cache,
        proxy,
        enhancer,
    })
}

/// Start every `auto_start` backend and the periodic health monitors.
pub fn spawn_background_tasks(state: &AppState) {
    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        supervisor.start_all().await;
        supervisor.spawn_health_monitors();
    });
}
