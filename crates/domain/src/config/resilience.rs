use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process supervisor timings shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Bound on the initial handshake before a server is declared running.
    #[serde(default = "d_10000")]
    pub startup_timeout_ms: u64,
    /// Time a process gets to exit after the termination signal.
    #[serde(default = "d_5000")]
    pub stop_grace_ms: u64,
    /// Uptime after which a manual restart also resets the restart counter.
    #[serde(default = "d_60")]
    pub stability_window_secs: u64,
    /// Timeout for a single periodic health probe.
    #[serde(default = "d_5000")]
    pub health_timeout_ms: u64,
    /// Pause before an automatic restart attempt.
    #[serde(default = "d_500")]
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            stop_grace_ms: 5_000,
            stability_window_secs: 60,
            health_timeout_ms: 5_000,
            restart_delay_ms: 500,
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Upper bound for per-request timeout overrides.
pub const MAX_CALL_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Default timeout for a proxied call.
    #[serde(default = "d_30000")]
    pub call_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
        }
    }
}

impl ProxyConfig {
    /// Effective timeout for one call, honouring a clamped per-request override.
    pub fn call_timeout(&self, override_ms: Option<u64>) -> Duration {
        let ms = override_ms
            .unwrap_or(self.call_timeout_ms)
            .clamp(1, MAX_CALL_TIMEOUT_MS);
        Duration::from_millis(ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Circuit breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "d_5u")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a trial call is admitted.
    #[serde(default = "d_30")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs: recovery_timeout.as_secs(),
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_10000() -> u64 {
    10_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_60() -> u64 {
    60
}
fn d_500() -> u64 {
    500
}
fn d_30000() -> u64 {
    30_000
}
fn d_5u() -> u32 {
    5
}
fn d_30() -> u64 {
    30
}
