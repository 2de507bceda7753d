//! Chat-JSON plumbing for OpenAI-compatible endpoints.
//!
//! The core never sees any of this; it only consumes typed result documents.

use anyhow::{bail, Context};
use serde_json::{json, Value};

/// One `llm.*` config bundle
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider name; 'openai' implies the default endpoint
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// API base URL (with `/v1`); required for non-openai providers
    pub endpoint: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            endpoint: None,
            api_key_env: None,
        }
    }
}

impl LlmConfig {
    /// Parse from a config value like
    /// `{"provider": "openai", "model": "...", "endpoint": ..., "api_key_env": ...}`
    pub fn from_value(value: Option<&Value>) -> Self {
        let defaults = Self::default();
        let Some(v) = value else { return defaults };
        Self {
            provider: v
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.provider)
                .to_string(),
            model: v
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.model)
                .to_string(),
            endpoint: v.get("endpoint").and_then(Value::as_str).map(str::to_string),
            api_key_env: v
                .get("api_key_env")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn base_url(&self) -> anyhow::Result<String> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        match self.provider.as_str() {
            "openai" => Ok("https://api.openai.com/v1".to_string()),
            other => bail!("provider '{other}' requires an explicit endpoint"),
        }
    }

    fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.clone().unwrap_or_else(|| match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY".to_string(),
            other => format!("{}_API_KEY", other.to_uppercase()),
        });
        std::env::var(var).ok()
    }
}

/// One chat round-trip that must come back as a single JSON object.
/// Malformed output is an error; the worker's retry/fallback policy decides
/// what happens next.
pub async fn chat_json(
    client: &reqwest::Client,
    config: &LlmConfig,
    system_prompt: &str,
    user_prompt: &str,
    max_tokens: u32,
) -> anyhow::Result<Value> {
    let url = format!("{}/chat/completions", config.base_url()?);
    let body = json!({
        "model": config.model,
        "messages": [
            { "role": "system", "content": system_prompt },
            { "role": "user", "content": user_prompt },
        ],
        "max_tokens": max_tokens,
        "temperature": 0.2,
        "response_format": { "type": "json_object" },
    });

    let mut request = client.post(&url).json(&body);
    if let Some(key) = config.api_key() {
        request = request.bearer_auth(key);
    }

    let response = request
        .timeout(std::time::Duration::from_secs(120))
        .send()
        .await
        .context("chat request failed")?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("chat endpoint returned {status}: {text}");
    }

    let payload: Value = response.json().await.context("chat response was not JSON")?;
    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .context("chat response had no message content")?;
    extract_json_object(content).context("model output did not contain a JSON object")
}

/// Pull the first top-level JSON object out of a model response
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let doc: Value = serde_json::from_str(&text[start..=end]).ok()?;
    doc.is_object().then_some(doc)
}
