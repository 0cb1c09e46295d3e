use std::sync::Arc;

use overseer::api;
use overseer::{AppState, Config};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overseer=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let port = config.port;
    info!(
        port,
        log_file = %config.tailer.path.display(),
        worker = %config.worker.program,
        "overseer starting"
    );

    let state = AppState::start(config).await?;
    let app = api::app(state.clone());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("listening on http://0.0.0.0:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.shutdown().await;
    info!("overseer stopped");
    Ok(())
}

/// Resolves on ctrl-c and closes viewer sessions so open WebSockets end.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    state.sessions().close_all();
}
