//! Prompt enhancement middleware.
//!
//! Rewrites the prompt argument of qualifying tool calls through a
//! completion service before the proxy forwards them. The service sits
//! behind its own circuit breaker and result cache. Any failure falls back
//! to the original prompt and is reported only in [`EnhanceOutcome`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use mh_domain::config::EnhanceConfig;
use mh_mcp_client::JsonRpcRequest;
use mh_providers::{CompletionProvider, CompletionRequest, OpenAiCompatProvider};

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::cache::{prompt_key, CacheStats, ResponseCache};
use super::error::{retry_after_secs, GatewayError};

/// Result of one enhancement attempt. `enhanced == original` whenever
/// `was_enhanced` is false.
#[derive(Debug, Clone, Serialize)]
pub struct EnhanceOutcome {
    pub original: String,
    pub enhanced: String,
    pub model: String,
    pub cached: bool,
    pub was_enhanced: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnhanceStats {
    pub enabled: bool,
    pub calls: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub slow_calls: u64,
    pub cache: CacheStats,
    pub breaker: BreakerSnapshot,
}

pub struct Enhancer {
    config: EnhanceConfig,
    provider: Option<Arc<dyn CompletionProvider>>,
    breaker: Arc<CircuitBreaker>,
    /// prompt key -> (enhanced text, model)
    cache: ResponseCache<(String, String)>,
    calls: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    slow_calls: AtomicU64,
}

impl Enhancer {
    /// Build from config. A disabled section, or one whose provider cannot
    /// be constructed, yields a passthrough enhancer.
    pub fn from_config(config: EnhanceConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let provider: Option<Arc<dyn CompletionProvider>> = if config.enabled {
            match OpenAiCompatProvider::from_config(&config) {
                Ok(p) => {
                    tracing::info!(provider = %p.provider_id(), model = %config.model, "prompt enhancement enabled");
                    Some(Arc::new(p))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "prompt enhancement disabled");
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, provider, breaker)
    }

    pub fn new(
        config: EnhanceConfig,
        provider: Option<Arc<dyn CompletionProvider>>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let cache = ResponseCache::new(config.cache_size, config.cache_ttl());
        Self {
            config,
            provider,
            breaker,
            cache,
            calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Whether a request should be enhanced. An explicit client choice wins
    /// over the auto-enhance policy; oversized bodies are always skipped.
    pub fn should_enhance(&self, method: &str, explicit: Option<bool>, body_len: usize) -> bool {
        if !self.is_enabled() || body_len > self.config.max_body_bytes {
            return false;
        }
        match explicit {
            Some(choice) => choice,
            None => self.config.auto_enhance && self.config.methods.iter().any(|m| m == method),
        }
    }

    /// Enhance one prompt. Never fails: every error degrades to the original.
    pub async fn enhance(&self, prompt: &str, bypass_cache: bool) -> EnhanceOutcome {
        let started = Instant::now();
        let model = self.config.model.clone();

        let Some(provider) = self.provider.as_ref() else {
            return self.fallback(prompt, model, started, "enhancement is not configured".into());
        };
        if prompt.len() > self.config.max_body_bytes {
            let reason = format!(
                "prompt of {} bytes exceeds size ceiling of {} bytes",
                prompt.len(),
                self.config.max_body_bytes
            );
            return self.fallback(prompt, model, started, reason);
        }

        let key = prompt_key(&model, prompt);
        if !bypass_cache {
            if let Some((enhanced, cached_model)) = self.cache.get(&key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return EnhanceOutcome {
                    original: prompt.to_owned(),
                    enhanced,
                    model: cached_model,
                    cached: true,
                    was_enhanced: true,
                    error: None,
                    elapsed_ms: elapsed_ms(started),
                };
            }
        }

        let admission = match self.breaker.check() {
            Ok(admission) => admission,
            Err(open) => {
                let reason = format!("circuit open, retry after {}s", retry_after_secs(open.retry_after));
                return self.fallback(prompt, model, started, reason);
            }
        };

        self.calls.fetch_add(1, Ordering::Relaxed);
        let req = CompletionRequest {
            system: self.config.system_prompt.clone(),
            prompt: prompt.to_owned(),
            model: Some(model.clone()),
            max_tokens: self.config.max_tokens,
        };
        let timeout = self.config.timeout();
        let result = tokio::time::timeout(timeout, provider.complete(&req)).await;

        let elapsed = started.elapsed();
        if elapsed >= self.config.slow_call_threshold() {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.slow_call_ms,
                model = %model,
                "slow enhancement call"
            );
        }

        let resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.breaker.record_failure(admission);
                return self.fallback(prompt, model, started, e.to_string());
            }
            Err(_) => {
                self.breaker.record_failure(admission);
                let reason = format!("timed out after {}ms", timeout.as_millis());
                return self.fallback(prompt, model, started, reason);
            }
        };

        let enhanced = resp.content.trim();
        if enhanced.is_empty() {
            self.breaker.record_failure(admission);
            return self.fallback(prompt, model, started, "empty completion".into());
        }

        self.breaker.record_success(admission);
        let model = if resp.model.is_empty() { model } else { resp.model };
        self.cache.set(key, (enhanced.to_owned(), model.clone()));
        tracing::debug!(model = %model, elapsed_ms = elapsed_ms(started), "prompt enhanced");

        EnhanceOutcome {
            original: prompt.to_owned(),
            enhanced: enhanced.to_owned(),
            model,
            cached: false,
            was_enhanced: true,
            error: None,
            elapsed_ms: elapsed_ms(started),
        }
    }

    /// Rewrite the prompt argument of `req` in place. Returns `None` when
    /// the request carries no prompt field.
    pub async fn apply(&self, req: &mut JsonRpcRequest, bypass_cache: bool) -> Option<EnhanceOutcome> {
        let (nested, field) = locate_prompt(req.params.as_ref()?, &self.config.prompt_fields)?;
        let prompt = prompt_target(req.params.as_ref()?, nested)
            .get(field.as_str())?
            .as_str()?
            .to_owned();

        let outcome = self.enhance(&prompt, bypass_cache).await;
        if outcome.was_enhanced {
            let params = req.params.as_mut()?;
            let target = if nested { params.get_mut("arguments")? } else { params };
            target[field.as_str()] = Value::String(outcome.enhanced.clone());
        }
        Some(outcome)
    }

    pub fn stats(&self) -> EnhanceStats {
        EnhanceStats {
            enabled: self.is_enabled(),
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            breaker: self.breaker.snapshot(),
        }
    }

    fn fallback(&self, prompt: &str, model: String, started: Instant, reason: String) -> EnhanceOutcome {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        let error = GatewayError::EnhancementUnavailable(reason);
        tracing::debug!(error = %error, "falling back to original prompt");
        EnhanceOutcome {
            original: prompt.to_owned(),
            enhanced: prompt.to_owned(),
            model,
            cached: false,
            was_enhanced: false,
            error: Some(error.to_string()),
            elapsed_ms: elapsed_ms(started),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Find the first configured prompt field holding a string, looking in
/// `params.arguments` before `params`. Returns (in_arguments, field).
fn locate_prompt(params: &Value, fields: &[String]) -> Option<(bool, String)> {
    let arguments = params.get("arguments").filter(|a| a.is_object());
    let candidates = [(true, arguments), (false, Some(params).filter(|p| p.is_object()))];
    candidates.into_iter().find_map(|(nested, obj)| {
        let obj = obj?;
        fields
            .iter()
            .find(|f| obj.get(f.as_str()).is_some_and(Value::is_string))
            .map(|f| (nested, f.clone()))
    })
}

fn prompt_target(params: &Value, nested: bool) -> &Value {
    if nested {
        &params["arguments"]
    } else {
        params
    }
}
