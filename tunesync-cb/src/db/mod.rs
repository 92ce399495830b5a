//! Database access for tunesync-cb

pub mod schema;
pub mod track_stems;
pub mod track_versions;
pub mod tracks;
pub mod webhook_deliveries;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool and the service's tables.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = tunesync_common::db::init_pool(db_path).await?;
    schema::init_tables(&pool).await?;
    Ok(pool)
}
