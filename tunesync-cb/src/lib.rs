//! tunesync-cb library interface
//!
//! Callback ingestion service for generative-music providers: webhook
//! dedupe, the per-stage state machine, version reconciliation, durable
//! upload fan-out, and stem resync. Exposed as a library for the
//! integration tests.

pub mod api;
pub mod db;
pub mod error;
pub mod services;
pub mod types;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use services::{
    CallbackProcessor, ObjectStorage, ProviderApi, StemReconciler, VariantUploader, VersionCache,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tunesync_common::cache::TtlCache;

/// Provider identity used for ledger rows and task correlation.
pub const PROVIDER_NAME: &str = "musegen";

/// Provider balance cache TTL; balance queries are rate-limited upstream.
pub const BALANCE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Callback state machine
    pub processor: CallbackProcessor,
    /// Push/pull stem reconciler
    pub reconciler: StemReconciler,
    /// Task id → last-seen variant array
    pub version_cache: VersionCache,
    /// Provider account balance cache; same TTL-map abstraction as the
    /// version cache, off the critical path
    pub balance_cache: TtlCache<String, f64>,
    /// Provider API for pull-based queries (stem status, balance)
    pub provider_api: Arc<dyn ProviderApi>,
    /// Provider identity for ledger rows
    pub provider: String,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last processing error, surfaced by /health
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire up the service around its collaborators. `storage_prefix`
    /// is the durable-storage public base; URLs under it are treated as
    /// higher quality than raw provider URLs.
    pub fn new(
        db: SqlitePool,
        storage: Arc<dyn ObjectStorage>,
        provider_api: Arc<dyn ProviderApi>,
        storage_prefix: String,
    ) -> Self {
        let version_cache: VersionCache =
            TtlCache::new(services::callback_processor::VERSION_CACHE_TTL);
        let uploader = VariantUploader::new(db.clone(), storage, storage_prefix.clone());
        let processor = CallbackProcessor::new(
            db.clone(),
            version_cache.clone(),
            uploader,
            PROVIDER_NAME.to_string(),
            storage_prefix,
        );
        let reconciler = StemReconciler::new(db.clone(), Arc::clone(&provider_api));

        Self {
            db,
            processor,
            reconciler,
            version_cache,
            balance_cache: TtlCache::new(BALANCE_CACHE_TTL),
            provider_api,
            provider: PROVIDER_NAME.to_string(),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember the most recent processing error for /health.
    pub async fn record_error(&self, message: &str) {
        *self.last_error.write().await = Some(message.to_string());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::callback_routes())
        .merge(api::stem_routes())
        .merge(api::balance_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
