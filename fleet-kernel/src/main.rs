/**
 * FLEET KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Bootstrap : config, logs, store, registre de sessions, API HTTP.
 * Ctrl-C ferme toutes les sessions vivantes avant de quitter.
 */

use anyhow::Context;
use fleet_kernel::config::load_config;
use fleet_kernel::http::{self, AppState};
use fleet_kernel::{MemoryStore, SessionRegistry};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_kernel=info")))
        .init();

    let cfg = load_config().await;

    let store = match &cfg.store.data_file {
        Some(path) => {
            if let Some(dir) = Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            }
            Arc::new(MemoryStore::open(path).with_context(|| format!("failed to open store {path}"))?)
        }
        None => Arc::new(MemoryStore::new()),
    };
    let registry = Arc::new(SessionRegistry::new());

    let app_state = AppState::new(&cfg, store.clone(), registry.clone());
    if app_state.api_key.is_none() {
        tracing::warn!("no api key configured, every route except /health will be refused");
    }

    let shutdown = CancellationToken::new();
    app_state
        .health_tracker
        .spawn_health_reporter(store.clone(), registry.clone(), shutdown.clone());

    let app = http::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .context("invalid server address")?;
    info!("listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(registry, shutdown))
        .await?;
    info!("kernel stopped");
    Ok(())
}

async fn shutdown_signal(registry: Arc<SessionRegistry>, shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
    }
    info!(sessions = registry.len(), "shutdown requested, closing agent sessions");
    shutdown.cancel();
    registry.close_all().await;
}
