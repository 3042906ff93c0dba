mod cache;
mod enhance;
mod mcp;
mod observability;
mod resilience;
mod server;

pub use cache::*;
pub use enhance::*;
pub use mcp::*;
pub use observability::*;
pub use resilience::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Breaker name reserved for the enhancement service.
pub const ENHANCEMENT_BREAKER: &str = "enhancement";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub enhance: EnhanceConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

/// `true` when any issue in the list is an error.
pub fn has_errors(issues: &[ConfigError]) -> bool {
    issues.iter().any(|i| i.severity == ConfigSeverity::Error)
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push(ConfigError::error(
                "server.max_concurrent_requests",
                "must be greater than 0",
            ));
        }

        validate_breaker("breaker", &self.breaker, &mut errors);
        validate_breaker("enhance.breaker", &self.enhance.breaker, &mut errors);

        if self.cache.max_size == 0 {
            errors.push(ConfigError::error("cache.max_size", "must be at least 1"));
        }
        if self.proxy.call_timeout_ms == 0 {
            errors.push(ConfigError::error("proxy.call_timeout_ms", "must be greater than 0"));
        }

        if self.enhance.enabled {
            if self.enhance.base_url.as_deref().map_or(true, str::is_empty) {
                errors.push(ConfigError::error(
                    "enhance.base_url",
                    "enhancement is enabled but no completion endpoint is configured",
                ));
            }
            if self.enhance.cache_size == 0 {
                errors.push(ConfigError::error("enhance.cache_size", "must be at least 1"));
            }
            if self.enhance.prompt_fields.is_empty() {
                errors.push(ConfigError::warning(
                    "enhance.prompt_fields",
                    "no prompt fields configured, tool calls will never be enhanced",
                ));
            }
        }

        errors.extend(validate_servers(&self.mcp));
        errors
    }
}

/// Validate a backend map on its own (used again on registry reconfiguration).
pub fn validate_servers(mcp: &McpConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    if mcp.servers.is_empty() {
        errors.push(ConfigError::warning("mcp.servers", "no backend servers configured"));
    }

    for (name, server) in &mcp.servers {
        let field = |f: &str| format!("mcp.servers.{name}.{f}");

        if name.trim().is_empty() {
            errors.push(ConfigError::error("mcp.servers", "server name must not be empty"));
        }
        if name == ENHANCEMENT_BREAKER {
            errors.push(ConfigError::error(
                format!("mcp.servers.{name}"),
                format!("\"{ENHANCEMENT_BREAKER}\" is reserved for the enhancement service breaker"),
            ));
        }
        match server.transport {
            McpTransportKind::Stdio if server.command.trim().is_empty() => {
                errors.push(ConfigError::error(field("command"), "command must not be empty"));
            }
            McpTransportKind::Sse => {
                errors.push(ConfigError::warning(
                    field("transport"),
                    "sse transport is not supported yet, the server cannot be started",
                ));
            }
            McpTransportKind::Stdio => {}
        }
        if server.restart_on_failure && server.max_restarts == 0 {
            errors.push(ConfigError::warning(
                field("max_restarts"),
                "restart_on_failure is set but max_restarts is 0",
            ));
        }
    }

    errors
}

fn validate_breaker(prefix: &str, cfg: &BreakerConfig, errors: &mut Vec<ConfigError>) {
    if cfg.failure_threshold == 0 {
        errors.push(ConfigError::error(
            format!("{prefix}.failure_threshold"),
            "must be at least 1",
        ));
    }
    if cfg.recovery_timeout_secs == 0 {
        errors.push(ConfigError::warning(
            format!("{prefix}.recovery_timeout_secs"),
            "0 lets a trial call through immediately after the circuit opens",
        ));
    }
}
