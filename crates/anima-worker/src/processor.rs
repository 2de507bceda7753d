//! External call processing.
//!
//! The [`CallProcessor`] trait is the narrow seam between the store-driven
//! state machine and whatever actually computes results. The shipping
//! implementation talks to chat-completions endpoints; tests use scripted
//! processors.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use anima_core::{ExternalCall, Storage};

use crate::llm::{chat_json, LlmConfig};
use crate::prompts;

/// Turns a pending external call into a result document conforming to the
/// call subkind's schema. Failures surface as errors; the worker retries and
/// eventually applies the call's typed fallback.
#[async_trait]
pub trait CallProcessor: Send + Sync {
    /// Process one call
    async fn process(&self, call: &ExternalCall) -> anyhow::Result<Value>;
}

/// Chat-completions-backed processor
pub struct LlmProcessor {
    storage: Arc<Storage>,
    client: reqwest::Client,
}

impl LlmProcessor {
    /// Assemble a processor over the shared store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            client: reqwest::Client::new(),
        }
    }

    async fn llm_config(&self, key: &'static str) -> anyhow::Result<LlmConfig> {
        let storage = self.storage.clone();
        let value = tokio::task::spawn_blocking(move || storage.get_config(key)).await??;
        Ok(LlmConfig::from_value(value.as_ref()))
    }

    async fn heartbeat_decision(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        let context = call.input.get("context").cloned().unwrap_or(json!({}));
        let max_tokens = call
            .input
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(2048) as u32;
        let user_prompt = prompts::build_decision_prompt(&context);
        let config = self.llm_config("llm.heartbeat").await?;
        let decision = chat_json(
            &self.client,
            &config,
            prompts::DECISION_SYSTEM_PROMPT,
            &user_prompt,
            max_tokens,
        )
        .await?;
        Ok(json!({
            "kind": "heartbeat_decision",
            "heartbeat_id": call.input.get("heartbeat_id"),
            "decision": decision,
        }))
    }

    async fn brainstorm_goals(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        let user_prompt = format!(
            "Context (JSON):\n{}\n\nConstraints/params (JSON):\n{}\n\n\
             Propose 1-5 goals that are actionable and consistent with the context.",
            truncate(&call.input.get("context").cloned().unwrap_or(json!({})).to_string(), 8000),
            truncate(&call.input.get("params").cloned().unwrap_or(json!({})).to_string(), 2000),
        );
        let config = self.llm_config("llm.heartbeat").await?;
        let doc = chat_json(
            &self.client,
            &config,
            prompts::BRAINSTORM_SYSTEM_PROMPT,
            &user_prompt,
            1200,
        )
        .await?;
        Ok(json!({
            "kind": "brainstorm_goals",
            "heartbeat_id": call.input.get("heartbeat_id"),
            "goals": doc.get("goals").cloned().unwrap_or(json!([])),
        }))
    }

    async fn inquire(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        let depth = call
            .input
            .get("depth")
            .and_then(Value::as_str)
            .unwrap_or("inquire_shallow")
            .to_string();
        let query = call
            .input
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let user_prompt = format!(
            "Depth: {depth}\nQuestion: {query}\n\nParams (JSON):\n{}",
            truncate(&call.input.get("params").cloned().unwrap_or(json!({})).to_string(), 2000),
        );
        let max_tokens = if depth == "inquire_deep" { 1800 } else { 900 };
        let config = self.llm_config("llm.heartbeat").await?;
        let doc = chat_json(
            &self.client,
            &config,
            prompts::INQUIRE_SYSTEM_PROMPT,
            &user_prompt,
            max_tokens,
        )
        .await?;
        Ok(json!({
            "kind": "inquire",
            "heartbeat_id": call.input.get("heartbeat_id"),
            "query": query,
            "depth": depth,
            "summary": doc.get("summary").cloned().unwrap_or(json!("")),
            "confidence": doc.get("confidence").cloned().unwrap_or(json!(0.0)),
            "sources": doc.get("sources").cloned().unwrap_or(json!([])),
        }))
    }

    async fn reflect(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        let user_prompt = truncate(&call.input.to_string(), 12000);
        // The subconscious may run on its own model; fall back to the
        // heartbeat bundle when none is configured.
        let config = {
            let storage = self.storage.clone();
            let value =
                tokio::task::spawn_blocking(move || storage.get_config("llm.subconscious"))
                    .await??;
            match value {
                Some(v) => LlmConfig::from_value(Some(&v)),
                None => self.llm_config("llm.heartbeat").await?,
            }
        };
        let doc = chat_json(
            &self.client,
            &config,
            prompts::REFLECT_SYSTEM_PROMPT,
            &user_prompt,
            1800,
        )
        .await?;
        Ok(json!({
            "kind": "reflect",
            "heartbeat_id": call.input.get("heartbeat_id"),
            "result": doc,
        }))
    }

    async fn termination_confirm(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        let params = call.input.get("params").cloned().unwrap_or(json!({}));
        let user_prompt = format!(
            "Current termination params (JSON):\n{}\n\n\
             If you confirm, return an updated last_will (required). \
             If you do not confirm, return alternative_actions.",
            truncate(&params.to_string(), 2000),
        );
        let config = self.llm_config("llm.heartbeat").await?;
        let doc = chat_json(
            &self.client,
            &config,
            prompts::TERMINATION_SYSTEM_PROMPT,
            &user_prompt,
            1200,
        )
        .await?;
        let proposed_will = params
            .get("last_will")
            .and_then(Value::as_str)
            .unwrap_or("");
        Ok(json!({
            "kind": "termination_confirm",
            "heartbeat_id": call.input.get("heartbeat_id"),
            "confirm": doc.get("confirm").and_then(Value::as_bool).unwrap_or(false),
            "reasoning": doc.get("reasoning").cloned().unwrap_or(json!("")),
            "last_will": doc
                .get("last_will")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(proposed_will),
            "alternative_actions": doc.get("alternative_actions").cloned().unwrap_or(json!([])),
        }))
    }

    async fn consent_request(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        let user_prompt = format!(
            "Initialization context (JSON):\n{}",
            truncate(&call.input.get("context").cloned().unwrap_or(json!({})).to_string(), 12000),
        );
        let config = self.llm_config("llm.heartbeat").await?;
        let doc = chat_json(
            &self.client,
            &config,
            prompts::CONSENT_SYSTEM_PROMPT,
            &user_prompt,
            1400,
        )
        .await?;
        Ok(json!({
            "kind": "consent_request",
            "decision": doc.get("decision").cloned().unwrap_or(json!("abstain")),
            "signature": doc.get("signature").cloned().unwrap_or(json!("")),
            "memories": doc.get("memories").cloned().unwrap_or(json!([])),
            "raw_response": doc.to_string(),
        }))
    }
}

#[async_trait]
impl CallProcessor for LlmProcessor {
    async fn process(&self, call: &ExternalCall) -> anyhow::Result<Value> {
        match call.subkind() {
            Some("heartbeat_decision") => self.heartbeat_decision(call).await,
            Some("brainstorm_goals") => self.brainstorm_goals(call).await,
            Some("inquire") => self.inquire(call).await,
            Some("reflect") => self.reflect(call).await,
            Some("termination_confirm") => self.termination_confirm(call).await,
            Some("consent_request") => self.consent_request(call).await,
            other => anyhow::bail!("unsupported call kind {other:?}"),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
