//! Process supervisor: owns every backend process and its connection.
//!
//! Lifecycle operations on one server (start, stop, restart, crash
//! recovery) are serialized by a per-server async lock, so a manual stop
//! can never interleave with an automatic restart. Each launch and stop
//! takes a fresh generation from a supervisor-wide counter; an exit
//! notification from any other generation is stale and ignored. The
//! counter outlives registry entries, so a server replaced on reload can
//! never reuse a generation of its predecessor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mh_domain::config::{self, BreakerConfig, ConfigError, McpConfig, McpServerConfig, SupervisorConfig};
use mh_mcp_client::McpConnection;

use super::breaker::{BreakerRegistry, BreakerStatus, CircuitBreaker};
use super::error::GatewayError;
use super::registry::{RegistryDiff, ServerEntry, ServerRegistry, ServerState, ServerStatus};

/// What to do after a backend exits unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    /// Budget exhausted: park in `Failed` until an operator steps in.
    GiveUp,
    /// Restarts disabled for this server.
    Stop,
}

pub fn decide_restart(config: &McpServerConfig, restart_count: u32) -> RestartDecision {
    if !config.restart_on_failure {
        RestartDecision::Stop
    } else if restart_count >= config.max_restarts {
        RestartDecision::GiveUp
    } else {
        RestartDecision::Restart
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub server: String,
    pub healthy: bool,
    pub status: ServerStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub breaker: BreakerStatus,
}

#[derive(Default)]
struct Slot {
    lifecycle: tokio::sync::Mutex<()>,
    conn: RwLock<Option<Arc<McpConnection>>>,
}

pub struct Supervisor {
    registry: Arc<ServerRegistry>,
    breakers: Arc<BreakerRegistry>,
    settings: SupervisorConfig,
    breaker_defaults: BreakerConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    monitors: Mutex<HashSet<String>>,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        breakers: Arc<BreakerRegistry>,
        settings: SupervisorConfig,
        breaker_defaults: BreakerConfig,
    ) -> Self {
        for name in registry.names() {
            breakers.get_or_create(&name, breaker_defaults);
        }
        Self {
            registry,
            breakers,
            settings,
            breaker_defaults,
            slots: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashSet::new()),
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(name, self.breaker_defaults)
    }

    fn entry(&self, name: &str) -> Result<Arc<ServerEntry>, GatewayError> {
        self.registry
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(name.to_owned()))
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        self.slots.lock().entry(name.to_owned()).or_default().clone()
    }

    /// The live connection for `name`, for proxying.
    pub fn connection(&self, name: &str) -> Result<Arc<McpConnection>, GatewayError> {
        let entry = self.entry(name)?;
        match entry.status() {
            ServerStatus::Failed => return Err(GatewayError::RestartBudgetExceeded(name.to_owned())),
            s if !s.is_live() => return Err(GatewayError::NotRunning(name.to_owned())),
            _ => {}
        }
        self.slot(name)
            .conn
            .read()
            .clone()
            .ok_or_else(|| GatewayError::NotRunning(name.to_owned()))
    }

    /// Requests awaiting a backend response on `name`.
    pub fn in_flight(&self, name: &str) -> usize {
        self.slots
            .lock()
            .get(name)
            .and_then(|slot| slot.conn.read().as_ref().map(|c| c.in_flight()))
            .unwrap_or(0)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Launch `name` and wait for its startup probe.
    ///
    /// Starting a `Failed` server is the manual intervention that clears
    /// its restart budget and breaker.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<ServerState, GatewayError> {
        let entry = self.entry(name)?;
        let slot = self.slot(name);
        let _lifecycle = slot.lifecycle.lock().await;

        match entry.status() {
            ServerStatus::Running | ServerStatus::Degraded | ServerStatus::Starting => {
                return Err(GatewayError::AlreadyRunning(name.to_owned()));
            }
            ServerStatus::Failed => self.clear_failure(&entry),
            ServerStatus::Stopped => {}
        }

        if let Err(e) = self.launch(&entry, &slot).await {
            entry.transition(ServerStatus::Stopped, Some(e.to_string()));
            return Err(e);
        }
        Ok(entry.state())
    }

    /// Terminate gracefully, force-kill after the grace period. Idempotent.
    pub async fn stop(&self, name: &str) -> Result<ServerState, GatewayError> {
        let entry = self.entry(name)?;
        let slot = self.slot(name);
        let _lifecycle = slot.lifecycle.lock().await;
        self.stop_locked(&entry, &slot).await;
        Ok(entry.state())
    }

    /// Stop then start. The restart budget is cleared only when the
    /// process had been up longer than the stability window.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<ServerState, GatewayError> {
        let entry = self.entry(name)?;
        let slot = self.slot(name);
        let _lifecycle = slot.lifecycle.lock().await;

        let state = entry.state();
        if state.status == ServerStatus::Failed {
            self.clear_failure(&entry);
        } else if state
            .launched
            .is_some_and(|t| t.elapsed() >= self.settings.stability_window())
        {
            entry.update(|s| s.restart_count = 0);
        }

        self.stop_locked(&entry, &slot).await;
        if let Err(e) = self.launch(&entry, &slot).await {
            entry.transition(ServerStatus::Stopped, Some(e.to_string()));
            return Err(e);
        }
        Ok(entry.state())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn clear_failure(&self, entry: &ServerEntry) {
        entry.update(|s| s.restart_count = 0);
        self.breaker(entry.name()).reset();
    }

    async fn stop_locked(&self, entry: &ServerEntry, slot: &Slot) {
        // Orphan the exit watcher of the current process.
        let generation = self.next_generation();
        entry.update(|s| s.generation = generation);
        let conn = slot.conn.write().take();
        if let Some(conn) = conn {
            let exit = conn.shutdown(self.settings.stop_grace()).await;
            tracing::debug!(server = %entry.name(), exit = ?exit, "backend stopped");
        }
        entry.transition(ServerStatus::Stopped, None);
    }

    /// Spawn, probe and publish a new process. Leaves the status at
    /// `Starting` on failure; callers decide where to go from there.
    async fn launch(self: &Arc<Self>, entry: &Arc<ServerEntry>, slot: &Slot) -> Result<(), GatewayError> {
        let name = entry.name().to_owned();
        entry.transition(ServerStatus::Starting, None);
        let generation = self.next_generation();
        entry.update(|s| s.generation = generation);

        let fail = |reason: String| {
            entry.update(|s| s.last_error = Some(reason.clone()));
            GatewayError::StartupFailed {
                server: name.clone(),
                reason,
            }
        };

        let conn = match McpConnection::spawn(&name, entry.config()) {
            Ok(conn) => Arc::new(conn),
            Err(e) => return Err(fail(e.to_string())),
        };

        if let Err(e) = conn.initialize(self.settings.startup_timeout()).await {
            conn.shutdown(self.settings.stop_grace()).await;
            return Err(fail(format!("startup probe failed: {e}")));
        }

        *slot.conn.write() = Some(conn.clone());
        let now = Utc::now();
        entry.update(|s| {
            s.pid = conn.pid();
            s.started_at = Some(now);
            s.last_health_check = Some(now);
            s.launched = Some(Instant::now());
            s.last_error = None;
        });
        entry.transition(ServerStatus::Running, None);
        tracing::info!(server = %name, pid = ?conn.pid(), generation, "backend ready");

        let sup = Arc::clone(self);
        tokio::spawn(async move {
            conn.closed().await;
            drop(conn);
            sup.handle_exit(name, generation).await;
        });
        Ok(())
    }

    /// Boxed: restarting from here re-enters `launch`, which spawns this.
    fn handle_exit(self: Arc<Self>, name: String, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(entry) = self.registry.get(&name) else {
                return;
            };
            let slot = self.slot(&name);
            let _lifecycle = slot.lifecycle.lock().await;

            let state = entry.state();
            if state.generation != generation || !state.status.is_live() {
                return;
            }

            let conn = slot.conn.write().take();
            let exit = match conn {
                Some(conn) => conn.shutdown(self.settings.stop_grace()).await,
                None => None,
            };
            let reason = match exit {
                Some(exit) => format!("process exited unexpectedly ({exit})"),
                None => "process exited unexpectedly".to_owned(),
            };
            tracing::warn!(server = %name, reason = %reason, "backend crashed");

            self.recover(&entry, &slot, reason).await;
        })
    }

    /// Apply the restart policy. Runs with the lifecycle lock held.
    async fn recover(self: &Arc<Self>, entry: &Arc<ServerEntry>, slot: &Slot, mut reason: String) {
        let window = self.settings.stability_window();
        entry.update(|s| {
            if s.launched.is_some_and(|t| t.elapsed() >= window) {
                s.restart_count = 0;
            }
        });

        loop {
            if self.shutdown.is_cancelled() {
                entry.transition(ServerStatus::Stopped, Some(reason));
                return;
            }

            let restart_count = entry.state().restart_count;
            match decide_restart(entry.config(), restart_count) {
                RestartDecision::Stop => {
                    entry.transition(ServerStatus::Stopped, Some(reason));
                    return;
                }
                RestartDecision::GiveUp => {
                    tracing::error!(
                        server = %entry.name(),
                        restarts = restart_count,
                        "restart budget exhausted, server marked failed"
                    );
                    entry.transition(
                        ServerStatus::Failed,
                        Some(format!(
                            "{reason}; gave up after {restart_count} restart(s)"
                        )),
                    );
                    return;
                }
                RestartDecision::Restart => {
                    let attempt = entry.update(|s| {
                        s.restart_count += 1;
                        s.restart_count
                    });
                    entry.transition(ServerStatus::Starting, Some(reason.clone()));
                    tracing::info!(
                        server = %entry.name(),
                        attempt,
                        max = entry.config().max_restarts,
                        "restarting backend"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => continue,
                        _ = tokio::time::sleep(self.settings.restart_delay()) => {}
                    }

                    match self.launch(entry, slot).await {
                        Ok(()) => return,
                        Err(e) => {
                            tracing::warn!(server = %entry.name(), error = %e, "restart attempt failed");
                            reason = e.to_string();
                        }
                    }
                }
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Health
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Probe `name` with `ping`, through its circuit breaker.
    ///
    /// Any answer counts as healthy. A failed probe moves Running to
    /// Degraded; a good one moves Degraded back to Running.
    pub async fn health_check(&self, name: &str) -> Result<HealthReport, GatewayError> {
        let entry = self.entry(name)?;
        let conn = self.connection(name)?;
        let generation = entry.state().generation;

        let breaker = self.breaker(name);
        let admission = breaker.check().map_err(|open| GatewayError::CircuitOpen {
            name: name.to_owned(),
            retry_after: open.retry_after,
        })?;

        let started = Instant::now();
        let result = conn.ping(self.settings.health_timeout()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(()) => {
                breaker.record_success(admission);
                None
            }
            Err(e) => {
                breaker.record_failure(admission);
                Some(e.to_string())
            }
        };

        // The process may have been replaced while we waited.
        if entry.state().generation == generation {
            entry.update(|s| s.last_health_check = Some(Utc::now()));
            match (&error, entry.status()) {
                (None, ServerStatus::Degraded) => {
                    entry.transition(ServerStatus::Running, None);
                }
                (Some(e), ServerStatus::Running) => {
                    tracing::warn!(server = %name, error = %e, "health check failed");
                    entry.transition(ServerStatus::Degraded, Some(format!("health check failed: {e}")));
                }
                _ => {}
            }
        }

        Ok(HealthReport {
            server: name.to_owned(),
            healthy: error.is_none(),
            status: entry.status(),
            latency_ms,
            error,
            breaker: breaker.status(),
        })
    }

    /// One periodic probe loop per server with a non-zero interval.
    pub fn spawn_health_monitors(self: &Arc<Self>) {
        for name in self.registry.names() {
            self.spawn_monitor(name);
        }
    }

    fn spawn_monitor(self: &Arc<Self>, name: String) {
        if !self.monitors.lock().insert(name.clone()) {
            return;
        }
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(interval) = sup
                    .registry
                    .get(&name)
                    .and_then(|e| e.config().health_check_interval())
                else {
                    break;
                };

                tokio::select! {
                    _ = sup.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let live = sup.registry.get(&name).is_some_and(|e| e.status().is_live());
                if !live {
                    continue;
                }
                match sup.health_check(&name).await {
                    Ok(report) if report.healthy => {
                        tracing::trace!(server = %name, latency_ms = report.latency_ms, "health check ok");
                    }
                    Ok(_) => {}
                    Err(GatewayError::CircuitOpen { retry_after, .. }) => {
                        tracing::debug!(server = %name, ?retry_after, "circuit open, skipping probe");
                    }
                    Err(e) => tracing::debug!(server = %name, error = %e, "health check skipped"),
                }
            }
            sup.monitors.lock().remove(&name);
            tracing::debug!(server = %name, "health monitor stopped");
        });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Fleet operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Start every `auto_start` server concurrently. Failures are logged.
    pub async fn start_all(self: &Arc<Self>) {
        let names: Vec<String> = self
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.config().auto_start)
            .map(|e| e.name().to_owned())
            .collect();

        let results = join_all(names.iter().map(|name| self.start(name))).await;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(state) => tracing::info!(server = %name, pid = ?state.pid, "auto-started"),
                Err(e) => tracing::error!(server = %name, error = %e, "auto-start failed"),
            }
        }
    }

    /// Swap in a new server set: stop removed and changed servers, then
    /// start and monitor the new ones.
    pub async fn reconfigure(self: &Arc<Self>, mcp: &McpConfig) -> Result<RegistryDiff, Vec<ConfigError>> {
        let issues = config::validate_servers(mcp);
        if config::has_errors(&issues) {
            return Err(issues);
        }

        let pending = self.registry.diff(mcp);
        for name in pending.removed.iter().chain(&pending.changed) {
            if let Err(e) = self.stop(name).await {
                tracing::debug!(server = %name, error = %e, "stop before reconfigure");
            }
        }

        let diff = self.registry.replace(mcp)?;
        for name in &diff.removed {
            self.breakers.remove(name);
            self.slots.lock().remove(name);
        }
        for name in &diff.changed {
            self.breakers.remove(name);
        }
        for name in diff.added.iter().chain(&diff.changed) {
            self.breaker(name);
            let auto_start = self.registry.get(name).is_some_and(|e| e.config().auto_start);
            if auto_start {
                if let Err(e) = self.start(name).await {
                    tracing::error!(server = %name, error = %e, "start after reconfigure failed");
                }
            }
            self.spawn_monitor(name.clone());
        }
        Ok(diff)
    }

    /// Stop every backend concurrently and halt monitors and restarts.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let entries = self.registry.entries();
        join_all(entries.iter().map(|entry| async move {
            let slot = self.slot(entry.name());
            let _lifecycle = slot.lifecycle.lock().await;
            self.stop_locked(entry, &slot).await;
        }))
        .await;
        tracing::info!(servers = entries.len(), "all backends stopped");
    }
}
