//! HTTP embedding provider.
//!
//! Implements the core's [`EmbeddingProvider`] seam against a small HTTP
//! service: `POST {base}/embed {"text": ...}` returning
//! `{"embedding": [f32; D]}`, with `GET {base}/health` as the liveness probe.
//! The blocking client is built lazily because `embed` only ever runs on
//! blocking threads (the core is synchronous).

use std::sync::{OnceLock, RwLock};

use serde_json::json;

use anima_core::{Embedding, EmbeddingError, EmbeddingProvider, EMBEDDING_DIMENSIONS};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8090";

/// Embedding provider over HTTP
pub struct HttpEmbedder {
    base_url: RwLock<String>,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpEmbedder {
    /// `base_url` may come from the CLI; otherwise the config value set via
    /// [`HttpEmbedder::set_default_url`] or the built-in default applies.
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: RwLock::new(base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string())),
            client: OnceLock::new(),
        }
    }

    /// Adopt the configured service URL (CLI wins, so only replace the default)
    pub fn set_default_url(&self, url: String) {
        let mut base = self.base_url.write().unwrap_or_else(|e| e.into_inner());
        if *base == DEFAULT_BASE_URL {
            *base = url;
        }
    }

    fn base(&self) -> String {
        self.base_url
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .trim_end_matches('/')
            .to_string()
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("build blocking client")
        })
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        let url = format!("{}/embed", self.base());
        let response = self
            .client()
            .post(&url)
            .json(&json!({ "text": text }))
            .send()
            .map_err(|e| EmbeddingError::ProviderUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmbeddingError::ProviderUnavailable(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let payload: serde_json::Value = response
            .json()
            .map_err(|e| EmbeddingError::ProviderUnavailable(e.to_string()))?;
        let vector: Vec<f32> = payload
            .get("embedding")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|x| x.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| {
                EmbeddingError::ProviderUnavailable("response had no embedding array".into())
            })?;
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(EmbeddingError::InvalidDimensions(
                EMBEDDING_DIMENSIONS,
                vector.len(),
            ));
        }
        Ok(Embedding::new(vector))
    }

    fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base());
        self.client()
            .get(&url)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
