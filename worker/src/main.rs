mod config;
mod handlers;
mod master_client;
mod session;
mod worker;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;
use crate::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=debug,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("señal de apagado recibida");
        signal.cancel();
    });

    Arc::new(Worker::new(config, shutdown)).run().await
}
