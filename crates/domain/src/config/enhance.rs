use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::BreakerConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt enhancement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Optional rewrite of prompt-bearing tool calls through an
/// OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhanceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Enhance qualifying requests without an explicit opt-in.
    #[serde(default)]
    pub auto_enhance: bool,
    /// Methods eligible for auto-enhancement.
    #[serde(default = "d_methods")]
    pub methods: Vec<String>,
    /// Argument names that carry the prompt text, checked in order.
    #[serde(default = "d_prompt_fields")]
    pub prompt_fields: Vec<String>,
    /// Request bodies larger than this are never enhanced.
    #[serde(default = "d_65536")]
    pub max_body_bytes: usize,
    #[serde(default = "d_15000")]
    pub timeout_ms: u64,
    /// Calls slower than this are logged as slow.
    #[serde(default = "d_5000")]
    pub slow_call_ms: u64,
    /// Base URL of the completion service (e.g. `https://api.openai.com/v1`).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "d_500")]
    pub cache_size: usize,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default = "d_enhance_breaker")]
    pub breaker: BreakerConfig,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_enhance: false,
            methods: d_methods(),
            prompt_fields: d_prompt_fields(),
            max_body_bytes: 65_536,
            timeout_ms: 15_000,
            slow_call_ms: 5_000,
            base_url: None,
            api_key_env: d_api_key_env(),
            model: d_model(),
            system_prompt: d_system_prompt(),
            max_tokens: None,
            cache_size: 500,
            cache_ttl_secs: None,
            breaker: d_enhance_breaker(),
        }
    }
}

impl EnhanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

fn d_methods() -> Vec<String> {
    vec!["tools/call".into()]
}
fn d_prompt_fields() -> Vec<String> {
    vec!["prompt".into(), "query".into()]
}
fn d_65536() -> usize {
    65_536
}
fn d_15000() -> u64 {
    15_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_500() -> usize {
    500
}
fn d_api_key_env() -> String {
    "MH_ENHANCE_API_KEY".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_system_prompt() -> String {
    "Rewrite the user's prompt so it is clear, specific and unambiguous. \
     Preserve its intent and language. Reply with the rewritten prompt only."
        .into()
}
fn d_enhance_breaker() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        recovery_timeout_secs: 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let cfg = EnhanceConfig::default();
        assert!(!cfg.enabled);
        assert!(!cfg.auto_enhance);
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.api_key_env, "MH_ENHANCE_API_KEY");
    }

    #[test]
    fn nested_breaker_parses() {
        let raw = r#"
            enabled = true
            base_url = "http://localhost:11434/v1"

            [breaker]
            failure_threshold = 2
        "#;
        let cfg: EnhanceConfig = toml::from_str(raw).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.breaker.failure_threshold, 2);
        assert_eq!(cfg.breaker.recovery_timeout_secs, 30);
        assert_eq!(cfg.prompt_fields, vec!["prompt", "query"]);
    }
}
