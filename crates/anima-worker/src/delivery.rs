//! Outbox delivery.
//!
//! At-least-once webhook delivery of outbox messages, addressed through
//! `user.contact` in config. Payloads carry a `message_id` so the receiving
//! side can deduplicate redelivery.

use std::sync::Arc;

use serde_json::Value;

use anima_core::{OutboxKind, OutboxMessage, Storage};

/// Webhook-backed delivery adapter
pub struct WebhookDelivery {
    storage: Arc<Storage>,
    client: reqwest::Client,
}

impl WebhookDelivery {
    /// Assemble a delivery adapter over the shared store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            client: reqwest::Client::new(),
        }
    }

    async fn destination_for(&self, kind: OutboxKind) -> Option<String> {
        let storage = self.storage.clone();
        let contact = tokio::task::spawn_blocking(move || storage.get_config("user.contact"))
            .await
            .ok()?
            .ok()??;
        let destinations = contact.get("destinations")?;
        let key = match kind {
            OutboxKind::User => "webhook",
            OutboxKind::Tool => "tool_webhook",
        };
        destinations
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Deliver one message and record the outcome on its row
    pub async fn deliver(&self, message: &OutboxMessage) {
        let Some(url) = self.destination_for(message.kind).await else {
            // Nowhere to send it; surface the payload in the log rather than
            // retrying forever against nothing.
            tracing::warn!(
                message = %message.id,
                payload = %message.payload,
                "no delivery destination configured; marking delivered"
            );
            self.record(message, true).await;
            return;
        };

        let delivered = match self
            .client
            .post(&url)
            .json(&message.payload)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    message = %message.id,
                    status = %response.status(),
                    "delivery rejected"
                );
                false
            }
            Err(e) => {
                tracing::warn!(message = %message.id, "delivery failed: {}", e);
                false
            }
        };
        self.record(message, delivered).await;
    }

    async fn record(&self, message: &OutboxMessage, delivered: bool) {
        let storage = self.storage.clone();
        let id = message.id.clone();
        let result = tokio::task::spawn_blocking(move || {
            if delivered {
                storage.mark_outbox_delivered(&id)
            } else {
                storage.mark_outbox_attempt_failed(&id)
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(message = %message.id, "outbox bookkeeping failed: {}", e);
        }
    }
}
