//! Server registry: declared backends and their live status.
//!
//! Configuration is immutable once loaded and only swapped wholesale by
//! [`ServerRegistry::replace`]. Status is written by the supervisor alone;
//! everything else reads snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;

use mh_domain::config::{self, ConfigError, McpConfig, McpServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Degraded,
    Failed,
}

impl ServerStatus {
    /// The lifecycle graph. Same-state "transitions" are not allowed here;
    /// callers treat them as no-ops before asking.
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Failed)
                | (Running, Degraded)
                | (Degraded, Running)
                | (Running | Degraded, Stopped)
                | (Running | Degraded, Starting)
                | (Running | Degraded, Failed)
                | (Failed, Starting)
                | (Failed, Stopped)
        )
    }

    /// A process is up and accepting requests.
    pub fn is_live(self) -> bool {
        matches!(self, ServerStatus::Running | ServerStatus::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Degraded => "degraded",
            ServerStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub status: ServerStatus,
    pub restart_count: u32,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Incremented on every launch; stale exit notifications compare against it.
    pub generation: u64,
    #[serde(skip)]
    pub(crate) launched: Option<Instant>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            status: ServerStatus::Stopped,
            restart_count: 0,
            pid: None,
            started_at: None,
            last_health_check: None,
            last_error: None,
            generation: 0,
            launched: None,
        }
    }
}

impl ServerState {
    /// Seconds since the current process was launched, while it is live.
    pub fn uptime_secs(&self) -> Option<u64> {
        if !self.status.is_live() {
            return None;
        }
        self.launched.map(|t| t.elapsed().as_secs())
    }
}

pub struct ServerEntry {
    name: String,
    config: Arc<McpServerConfig>,
    state: Mutex<ServerState>,
}

impl ServerEntry {
    fn new(name: &str, config: McpServerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config: Arc::new(config),
            state: Mutex::new(ServerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        self.state.lock().status
    }

    pub fn state(&self) -> ServerState {
        self.state.lock().clone()
    }

    /// Move to `next` if the lifecycle graph allows it. Returns whether the
    /// status changed.
    pub(crate) fn transition(&self, next: ServerStatus, error: Option<String>) -> bool {
        let mut st = self.state.lock();
        let prev = st.status;
        if prev == next {
            if error.is_some() {
                st.last_error = error;
            }
            return false;
        }
        if !prev.can_transition_to(next) {
            tracing::warn!(server = %self.name, from = %prev, to = %next, "rejected status transition");
            return false;
        }
        st.status = next;
        if error.is_some() {
            st.last_error = error;
        }
        if !next.is_live() {
            st.pid = None;
        }
        drop(st);
        tracing::info!(server = %self.name, from = %prev, to = %next, "server status changed");
        true
    }

    /// Mutate the live state under its lock.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

/// Serializable view for the API and CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    pub name: String,
    pub config: McpServerConfig,
    pub state: ServerState,
    pub uptime_secs: Option<u64>,
}

/// What changed in a [`ServerRegistry::replace`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Default)]
pub struct ServerRegistry {
    entries: RwLock<BTreeMap<String, Arc<ServerEntry>>>,
}

impl ServerRegistry {
    /// Build from the `[mcp]` section. Fails on any validation error.
    pub fn from_config(mcp: &McpConfig) -> Result<Self, Vec<ConfigError>> {
        check(mcp)?;
        let entries = mcp
            .servers
            .iter()
            .map(|(name, cfg)| (name.clone(), Arc::new(ServerEntry::new(name, cfg.clone()))))
            .collect();
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerEntry>> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<Arc<ServerEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn view(&self, name: &str) -> Option<ServerView> {
        self.get(name).map(|e| view_of(&e))
    }

    pub fn list(&self) -> Vec<ServerView> {
        self.entries.read().values().map(|e| view_of(e)).collect()
    }

    /// Compute what [`replace`](Self::replace) would change.
    pub fn diff(&self, mcp: &McpConfig) -> RegistryDiff {
        let current = self.entries.read();
        let mut diff = RegistryDiff::default();
        for (name, cfg) in &mcp.servers {
            match current.get(name) {
                None => diff.added.push(name.clone()),
                Some(entry) if entry.config() != cfg => diff.changed.push(name.clone()),
                Some(_) => {}
            }
        }
        diff.removed = current
            .keys()
            .filter(|name| !mcp.servers.contains_key(*name))
            .cloned()
            .collect();
        diff
    }

    /// Swap in a new server set. Unchanged entries keep their live state;
    /// added and changed ones start out Stopped. The caller stops removed
    /// and changed servers first.
    pub fn replace(&self, mcp: &McpConfig) -> Result<RegistryDiff, Vec<ConfigError>> {
        check(mcp)?;
        let diff = self.diff(mcp);
        let mut entries = self.entries.write();
        let mut next = BTreeMap::new();
        for (name, cfg) in &mcp.servers {
            let entry = match entries.remove(name) {
                Some(existing) if existing.config() == cfg => existing,
                _ => Arc::new(ServerEntry::new(name, cfg.clone())),
            };
            next.insert(name.clone(), entry);
        }
        *entries = next;
        drop(entries);

        if !diff.is_empty() {
            tracing::info!(
                added = ?diff.added,
                removed = ?diff.removed,
                changed = ?diff.changed,
                "server registry replaced"
            );
        }
        Ok(diff)
    }
}

fn check(mcp: &McpConfig) -> Result<(), Vec<ConfigError>> {
    let issues = config::validate_servers(mcp);
    if config::has_errors(&issues) {
        return Err(issues);
    }
    for issue in &issues {
        tracing::warn!("config: {issue}");
    }
    Ok(())
}

fn view_of(entry: &ServerEntry) -> ServerView {
    let state = entry.state();
    ServerView {
        name: entry.name.clone(),
        config: (*entry.config).clone(),
        uptime_secs: state.uptime_secs(),
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcp(servers: &[(&str, &str)]) -> McpConfig {
        McpConfig {
            servers: servers
                .iter()
                .map(|(n, cmd)| (n.to_string(), McpServerConfig::stdio(*cmd, &[])))
                .collect(),
        }
    }

    #[test]
    fn lifecycle_graph() {
        use ServerStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Running));
        assert!(Degraded.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Starting));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Degraded));
        assert!(!Starting.can_transition_to(Degraded));
    }

    #[test]
    fn transition_respects_graph() {
        let reg = ServerRegistry::from_config(&mcp(&[("fs", "fs-server")])).unwrap();
        let entry = reg.get("fs").unwrap();
        assert_eq!(entry.status(), ServerStatus::Stopped);

        assert!(!entry.transition(ServerStatus::Running, None));
        assert_eq!(entry.status(), ServerStatus::Stopped);

        assert!(entry.transition(ServerStatus::Starting, None));
        assert!(entry.transition(ServerStatus::Running, None));
        assert!(entry.transition(ServerStatus::Degraded, Some("ping timed out".into())));
        assert_eq!(entry.state().last_error.as_deref(), Some("ping timed out"));
        assert!(!entry.transition(ServerStatus::Degraded, None));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = mcp(&[("fs", "")]);
        let errs = ServerRegistry::from_config(&bad).err().unwrap();
        assert!(errs.iter().any(|e| e.field.contains("command")));
    }

    #[test]
    fn replace_keeps_unchanged_entries() {
        let reg = ServerRegistry::from_config(&mcp(&[("a", "x"), ("b", "y")])).unwrap();
        let a = reg.get("a").unwrap();
        a.transition(ServerStatus::Starting, None);

        let diff = reg.replace(&mcp(&[("a", "x"), ("b", "changed"), ("c", "z")])).unwrap();
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.changed, vec!["b"]);
        assert!(diff.removed.is_empty());

        assert!(Arc::ptr_eq(&a, &reg.get("a").unwrap()));
        assert_eq!(reg.get("a").unwrap().status(), ServerStatus::Starting);
        assert_eq!(reg.get("b").unwrap().config().command, "changed");

        let diff = reg.replace(&mcp(&[("c", "z")])).unwrap();
        assert_eq!(diff.removed, vec!["a", "b"]);
        assert_eq!(reg.names(), vec!["c"]);
    }

    #[test]
    fn replace_revalidates() {
        let reg = ServerRegistry::from_config(&mcp(&[("a", "x")])).unwrap();
        assert!(reg.replace(&mcp(&[("enhancement", "x")])).is_err());
        assert_eq!(reg.names(), vec!["a"]);
    }

    #[test]
    fn views_serialize_status() {
        let reg = ServerRegistry::from_config(&mcp(&[("fs", "fs-server")])).unwrap();
        let json = serde_json::to_value(reg.list()).unwrap();
        assert_eq!(json[0]["name"], "fs");
        assert_eq!(json[0]["state"]["status"], "stopped");
        assert_eq!(json[0]["config"]["command"], "fs-server");
    }
}
