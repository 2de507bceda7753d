//! Worker loops.
//!
//! Each loop polls roughly once a second, does any due work through the
//! store, and goes back to sleep. Errors are logged and the loop continues;
//! the only exits are termination and shutdown signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use anima_core::{ApplyOutcome, ExternalCall, OutboxMessage, Storage};

use crate::delivery::WebhookDelivery;
use crate::processor::CallProcessor;

/// Poll interval for both loops
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Dispatch attempts before a call is failed and its fallback applied
const MAX_RETRIES: i64 = 3;

/// Cooperative shutdown flag shared by the loops and the signal handler
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// New, unrequested
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop to stop at its next poll
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has shutdown been requested?
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn blocking<T, F>(storage: &Arc<Storage>, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Storage) -> anima_core::Result<T> + Send + 'static,
{
    let storage = storage.clone();
    Ok(tokio::task::spawn_blocking(move || f(&storage)).await??)
}

async fn agent_ready(storage: &Arc<Storage>) -> bool {
    blocking(storage, |s| {
        Ok(s.is_agent_configured()? && s.is_init_complete()?)
    })
    .await
    .unwrap_or(false)
}

async fn agent_terminated(storage: &Arc<Storage>) -> bool {
    blocking(storage, |s| s.is_agent_terminated())
        .await
        .unwrap_or(false)
}

/// Dispatch one claimed call: process, apply, and on repeated failure apply
/// the typed fallback document. Returns the apply outcome when one happened.
async fn dispatch_call(
    storage: &Arc<Storage>,
    processor: &Arc<dyn CallProcessor>,
    call: ExternalCall,
) -> Option<ApplyOutcome> {
    let attempts = match blocking(storage, {
        let id = call.id.clone();
        move |s| s.claim_call(&id)
    })
    .await
    {
        Ok(Some(attempts)) => attempts,
        Ok(None) => return None, // someone else took it
        Err(e) => {
            tracing::error!(call = %call.id, "claim failed: {}", e);
            return None;
        }
    };

    let output = match processor.process(&call).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(call = %call.id, attempts, "external call failed: {}", e);
            if attempts >= MAX_RETRIES {
                let _ = blocking(storage, {
                    let id = call.id.clone();
                    move |s| s.mark_call_failed(&id)
                })
                .await;
                call.fallback_output()
            } else {
                // Exponential backoff before the next poll retries it
                let backoff = 1u64 << attempts.clamp(0, 5) as u32;
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                let _ = blocking(storage, {
                    let id = call.id.clone();
                    move |s| s.mark_call_pending(&id)
                })
                .await;
                return None;
            }
        }
    };

    apply_output(storage, &call.id, output).await
}

async fn apply_output(
    storage: &Arc<Storage>,
    call_id: &str,
    output: Value,
) -> Option<ApplyOutcome> {
    let result = blocking(storage, {
        let call_id = call_id.to_string();
        move |s| s.apply_external_call_result(&call_id, &output)
    })
    .await;
    match result {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            // Park the call so a doomed result does not loop forever; crash
            // recovery will settle any heartbeat left waiting on it.
            tracing::error!(call = call_id, "apply failed: {}", e);
            let _ = blocking(storage, {
                let id = call_id.to_string();
                move |s| s.mark_call_failed(&id)
            })
            .await;
            None
        }
    }
}

// ============================================================================
// HEARTBEAT WORKER
// ============================================================================

/// Drives heartbeat cycles and dispatches their external calls
pub struct HeartbeatWorker {
    storage: Arc<Storage>,
    processor: Arc<dyn CallProcessor>,
    delivery: Arc<WebhookDelivery>,
    shutdown: Shutdown,
}

impl HeartbeatWorker {
    /// Assemble a heartbeat worker
    pub fn new(
        storage: Arc<Storage>,
        processor: Arc<dyn CallProcessor>,
        delivery: Arc<WebhookDelivery>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            storage,
            processor,
            delivery,
            shutdown,
        }
    }

    /// Run until termination or shutdown
    pub async fn run(&self) {
        tracing::info!("heartbeat worker starting");
        while !self.shutdown.requested() {
            if agent_terminated(&self.storage).await {
                tracing::info!("agent is terminated; heartbeat worker exiting");
                break;
            }
            if agent_ready(&self.storage).await {
                if let Err(e) = self.tick().await {
                    tracing::error!("heartbeat loop error: {}", e);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        tracing::info!("heartbeat worker stopped");
    }

    async fn tick(&self) -> anyhow::Result<()> {
        // Start a cycle when due; its decision call lands in the ledger
        if let Some(start) = blocking(&self.storage, |s| s.run_heartbeat()).await? {
            tracing::info!(heartbeat = %start.heartbeat_id, "heartbeat started");
        }

        // Drain dispatchable calls (fresh decisions, suspended actions,
        // subconscious reflections)
        let calls = blocking(&self.storage, |s| s.list_dispatchable_calls(8)).await?;
        for call in calls {
            if self.shutdown.requested() {
                break;
            }
            if let Some(outcome) = dispatch_call(&self.storage, &self.processor, call).await {
                self.publish(outcome.outbox_messages).await;
                if outcome.terminated {
                    tracing::info!("termination executed; requesting shutdown");
                    self.shutdown.request();
                    return Ok(());
                }
            }
        }

        // At-least-once delivery of anything still pending
        let pending = blocking(&self.storage, |s| s.list_pending_outbox(16)).await?;
        self.publish(pending).await;
        Ok(())
    }

    async fn publish(&self, messages: Vec<OutboxMessage>) {
        for message in messages {
            self.delivery.deliver(&message).await;
        }
    }
}

// ============================================================================
// MAINTENANCE WORKER
// ============================================================================

/// Runs maintenance passes and the subconscious decider
pub struct MaintenanceWorker {
    storage: Arc<Storage>,
    processor: Arc<dyn CallProcessor>,
    shutdown: Shutdown,
}

impl MaintenanceWorker {
    /// Assemble a maintenance worker
    pub fn new(
        storage: Arc<Storage>,
        processor: Arc<dyn CallProcessor>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            storage,
            processor,
            shutdown,
        }
    }

    /// Run until termination or shutdown
    pub async fn run(&self) {
        tracing::info!("maintenance worker starting");
        while !self.shutdown.requested() {
            if agent_terminated(&self.storage).await {
                tracing::info!("agent is terminated; maintenance worker exiting");
                break;
            }
            if agent_ready(&self.storage).await {
                if let Err(e) = self.tick().await {
                    tracing::error!("maintenance loop error: {}", e);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        tracing::info!("maintenance worker stopped");
    }

    async fn tick(&self) -> anyhow::Result<()> {
        if let Some(stats) = blocking(&self.storage, |s| s.run_maintenance_if_due()).await? {
            tracing::info!(?stats, "maintenance pass");
        }

        if blocking(&self.storage, |s| s.should_run_subconscious_decider()).await? {
            if let Some(call) =
                blocking(&self.storage, |s| s.start_subconscious_reflection()).await?
            {
                tracing::info!(call = %call.id, "subconscious reflection dispatched");
                dispatch_call(&self.storage, &self.processor, call).await;
            }
        }
        Ok(())
    }
}
