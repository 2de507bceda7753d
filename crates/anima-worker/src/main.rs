//! Anima background workers.
//!
//! Two cooperative poll loops over one shared store: the heartbeat worker
//! runs reasoning cycles and dispatches their external calls; the maintenance
//! worker keeps the substrate healthy and runs the subconscious decider.
//! They never share in-memory state beyond the `Storage` handle itself.

mod delivery;
mod embedder;
mod llm;
mod processor;
mod prompts;
mod workers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use anima_core::Storage;

use crate::delivery::WebhookDelivery;
use crate::embedder::HttpEmbedder;
use crate::processor::LlmProcessor;
use crate::workers::{HeartbeatWorker, MaintenanceWorker, Shutdown};

/// Which loops to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Heartbeat loop only
    Heartbeat,
    /// Maintenance loop only
    Maintenance,
    /// Both loops in one process
    Both,
}

/// Run the anima background workers
#[derive(Debug, Parser)]
#[command(name = "anima-worker", version, about)]
struct Cli {
    /// Which worker loop(s) to run
    #[arg(long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Database path (defaults to the platform data directory)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Embedding service URL (overrides `embedding.service_url` in config)
    #[arg(long)]
    embedding_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let embedder = Arc::new(HttpEmbedder::new(cli.embedding_url.clone()));
    let storage = Arc::new(
        Storage::new(cli.db_path.clone(), embedder.clone())
            .context("failed to open the store")?,
    );

    // Let the embedder fall back to the configured service URL
    if let Some(url) = storage
        .get_config("embedding.service_url")
        .ok()
        .flatten()
        .and_then(|v| v.as_str().map(str::to_string))
    {
        embedder.set_default_url(url);
    }

    // Heartbeats interrupted by a previous crash either resume (a pending
    // call exists) or get abandoned with an audit memory.
    let abandoned = {
        let storage = storage.clone();
        tokio::task::spawn_blocking(move || storage.recover_unfinalized_heartbeats())
            .await?
            .context("crash recovery failed")?
    };
    if !abandoned.is_empty() {
        tracing::warn!(count = abandoned.len(), "abandoned interrupted heartbeats");
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let processor = Arc::new(LlmProcessor::new(storage.clone()));
    let delivery = Arc::new(WebhookDelivery::new(storage.clone()));

    tracing::info!(mode = ?cli.mode, "starting workers");
    let mut handles = Vec::new();
    if matches!(cli.mode, Mode::Heartbeat | Mode::Both) {
        let worker = HeartbeatWorker::new(
            storage.clone(),
            processor.clone(),
            delivery.clone(),
            shutdown.clone(),
        );
        handles.push(tokio::spawn(async move { worker.run().await }));
    }
    if matches!(cli.mode, Mode::Maintenance | Mode::Both) {
        let worker = MaintenanceWorker::new(storage.clone(), processor, shutdown.clone());
        handles.push(tokio::spawn(async move { worker.run().await }));
    }

    for handle in handles {
        handle.await?;
    }
    tracing::info!("workers stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        shutdown.request();
    });
}
