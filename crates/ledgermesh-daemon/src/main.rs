//! `ledgermeshd`: the event aggregation and delivery daemon.
//!
//! Wires the persistence gateway, content store, event core, and the
//! WebSocket transport, then serves `GET /ws` until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ledgermesh_core::shutdown;
use ledgermesh_core::store::{Database, SqliteStore};

use ledgermesh_daemon::config::DaemonConfig;
use ledgermesh_daemon::contentstore::LocalContentStore;
use ledgermesh_daemon::events::EventManager;
use ledgermesh_daemon::transport::websockets::WebSockets;
use ledgermesh_daemon::transport::Transport;

#[derive(Debug, Parser)]
#[command(name = "ledgermeshd", about = "ledgermesh event delivery daemon")]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DaemonConfig::load(path).context("loading configuration")?,
        None => DaemonConfig::default(),
    };

    let (shutdown_handle, shutdown) = shutdown::channel();

    let database: Arc<dyn Database> =
        Arc::new(SqliteStore::open(&config.database.path).context("opening database")?);
    let content_store = Arc::new(LocalContentStore::new(&config.content_store.path));

    let event_manager = Arc::new(EventManager::new(
        &config,
        shutdown.clone(),
        database,
        content_store,
    ));

    let websockets = WebSockets::new(shutdown.clone(), config.websockets.clone());
    let callbacks =
        event_manager.register_transport(Arc::clone(&websockets) as Arc<dyn Transport>);
    websockets.init(callbacks);

    event_manager.start();

    let listener = tokio::net::TcpListener::bind(config.http.listen)
        .await
        .context("binding http listener")?;
    info!(addr = %config.http.listen, "listening for websocket consumers");

    let router = websockets.router();
    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT")?;

    let finished_early = tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
            None
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
            None
        }
        result = &mut server => Some(result),
    };

    info!("shutting down");
    shutdown_handle.shutdown();

    let server_result = match finished_early {
        Some(result) => result,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(%e, "http server failed"),
        Err(e) => error!(%e, "http server task failed"),
    }

    event_manager.wait_stop().await;
    websockets.wait_closed().await;

    info!("shutdown complete");
    Ok(())
}
