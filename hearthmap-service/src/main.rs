use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use hearthmap_core::Catalog;
use hearthmap_service::{build_router, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_ansi(false).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cfg = Config::from_env();
    std::fs::create_dir_all(&cfg.grid_storage)
        .with_context(|| format!("failed to create {}", cfg.grid_storage.display()))?;
    std::fs::create_dir_all(cfg.hmap_sources_dir())?;
    std::fs::create_dir_all(cfg.texture_cache_dir())?;

    // bootstrap the catalog schema before any daemon opens a handle
    Catalog::open(&cfg.catalog_path)
        .with_context(|| format!("failed to open catalog {}", cfg.catalog_path.display()))?;

    let state = AppState::new(cfg.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Arc::clone(&state.orchestrator).spawn_scheduler(shutdown_rx.clone());
    Arc::clone(&state.large_tiles).spawn_pregenerator(shutdown_rx);

    let app = build_router(state);
    info!(addr = %cfg.addr, storage = %cfg.grid_storage.display(), "starting hearthmap-service");
    let listener = TcpListener::bind(cfg.addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;
    Ok(())
}
