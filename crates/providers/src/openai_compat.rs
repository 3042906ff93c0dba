//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions contract.

use crate::traits::{CompletionProvider, CompletionRequest, CompletionResponse};
use crate::util::{api_key_from_env, from_reqwest};
use mh_domain::config::EnhanceConfig;
use mh_domain::error::{Error, Result};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A completion provider for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider from the `[enhance]` config section.
    ///
    /// The HTTP client timeout follows `enhance.timeout_ms`.
    pub fn from_config(cfg: &EnhanceConfig) -> Result<Self> {
        let base_url = cfg
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::Config("enhance.base_url is not set".into()))?;

        let api_key = api_key_from_env(&cfg.api_key_env);
        if api_key.is_none() {
            tracing::debug!(
                env_var = %cfg.api_key_env,
                "no API key for enhancement endpoint, sending unauthenticated requests"
            );
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: "openai_compat".into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            client,
        })
    }

    // ── Internal: build the JSON body ─────────────────────────────

    fn effective_model(&self, req: &CompletionRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if !req.system.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": req.system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": req.prompt}));

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": false,
        });
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_completion_response(body: &Value, fallback_model: &str) -> Result<CompletionResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "openai_compat".into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: "openai_compat".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback_model)
        .to_string();

    Ok(CompletionResponse { content, model })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(req);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat completion request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_completion_response(&resp_json, &self.effective_model(req))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatProvider {
        let cfg = EnhanceConfig {
            enabled: true,
            base_url: Some("http://localhost:11434/v1/".into()),
            api_key_env: "MH_TEST_UNSET_ENHANCE_KEY".into(),
            ..Default::default()
        };
        OpenAiCompatProvider::from_config(&cfg).unwrap()
    }

    #[test]
    fn base_url_is_required() {
        let cfg = EnhanceConfig::default();
        let err = OpenAiCompatProvider::from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let p = provider();
        assert_eq!(p.base_url, "http://localhost:11434/v1");
        assert!(p.api_key.is_none());
    }

    #[test]
    fn body_has_system_then_user() {
        let p = provider();
        let req = CompletionRequest {
            system: "be precise".into(),
            prompt: "find docs".into(),
            model: None,
            max_tokens: Some(128),
        };
        let body = p.build_body(&req);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "find docs");
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn empty_system_is_omitted() {
        let p = provider();
        let req = CompletionRequest {
            prompt: "x".into(),
            model: Some("llama3".into()),
            ..Default::default()
        };
        let body = p.build_body(&req);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["model"], "llama3");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn parses_first_choice() {
        let body = serde_json::json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{"message": {"role": "assistant", "content": "better prompt"}}]
        });
        let resp = parse_completion_response(&body, "fallback").unwrap();
        assert_eq!(resp.content, "better prompt");
        assert_eq!(resp.model, "gpt-4o-mini-2024");
    }

    #[test]
    fn missing_model_uses_fallback() {
        let body = serde_json::json!({"choices": [{"message": {"content": "ok"}}]});
        let resp = parse_completion_response(&body, "fallback").unwrap();
        assert_eq!(resp.model, "fallback");
    }

    #[test]
    fn no_choices_is_provider_error() {
        let body = serde_json::json!({"choices": []});
        assert!(matches!(
            parse_completion_response(&body, "m"),
            Err(Error::Provider { .. })
        ));
    }
}
