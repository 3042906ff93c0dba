use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cache for proxied tool-call responses.
///
/// Only methods listed in `cacheable_methods` are ever stored; anything
/// with side effects should stay out of that list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Maximum number of entries before the least recently used is evicted.
    #[serde(default = "d_1000")]
    pub max_size: usize,
    /// Optional time-to-live for each entry.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// JSON-RPC methods whose responses are deterministic and idempotent.
    #[serde(default = "d_cacheable_methods")]
    pub cacheable_methods: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            ttl_secs: None,
            cacheable_methods: d_cacheable_methods(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn is_cacheable(&self, method: &str) -> bool {
        self.enabled && self.cacheable_methods.iter().any(|m| m == method)
    }
}

fn d_true() -> bool {
    true
}
fn d_1000() -> usize {
    1000
}
fn d_cacheable_methods() -> Vec<String> {
    vec![
        "tools/list".into(),
        "resources/list".into(),
        "prompts/list".into(),
    ]
}
