mod config;
mod failover;
mod handlers;
mod monitor;
mod scheduler;
mod sessions;
mod state;
mod stealing;
mod workers;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::MasterConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=debug,tower_http=info")),
        )
        .init();

    let config = MasterConfig::from_env()?;
    info!(
        "max_failover_attempts={} worker_dead_timeout={:?}",
        config.failover.max_failover_attempts(),
        config.worker_dead_timeout
    );

    let state = AppState::new(config);
    let shutdown = CancellationToken::new();

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor = tokio::spawn(monitor::monitor_workers(state.clone(), shutdown.clone()));

    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", state.config.listen_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    let sessions = state.sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("apagando master");
            // libera los long-polls de sesión antes de cerrar conexiones
            sessions.close_all();
            shutdown.cancel();
        })
        .await?;

    let _ = monitor.await;
    Ok(())
}
