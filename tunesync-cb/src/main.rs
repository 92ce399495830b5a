//! tunesync-cb - Callback Ingestion Service
//!
//! Ingests asynchronous generation callbacks from the music provider,
//! keeps the first available variant playable, persists every variant
//! to durable storage in the background, and reconciles stem
//! separation results via push and pull.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunesync_cb::services::{CleanupDaemon, HttpObjectStorage, ProviderClient};
use tunesync_cb::AppState;
use tunesync_common::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting tunesync-cb (Callback Ingestion) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Resolve configuration (env, TOML file, compiled defaults) and make
    // sure the root folder exists before touching the database
    let config = ServiceConfig::resolve("callback")?;
    config.ensure_root_folder()?;

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = tunesync_cb::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    let storage = Arc::new(HttpObjectStorage::new(
        config.storage_endpoint.clone(),
        config.storage_public_base.clone(),
    )?);
    let provider_api = Arc::new(ProviderClient::new(
        config.provider_api_base.clone(),
        config.provider_api_key.clone(),
    )?);

    let state = AppState::new(
        db_pool.clone(),
        storage,
        provider_api,
        config.storage_public_base.clone(),
    );

    // Periodic maintenance: cache eviction, ledger pruning, stuck tracks
    CleanupDaemon::new(db_pool, state.version_cache.clone()).spawn();
    state
        .balance_cache
        .spawn_sweeper(std::time::Duration::from_secs(300), "balance");

    let app = tunesync_cb::build_router(state);

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{bind_addr}");
    info!("Health check: http://{bind_addr}/health");

    axum::serve(listener, app).await?;

    Ok(())
}
