//! Table creation for tunesync-cb
//!
//! Idempotent CREATE TABLE IF NOT EXISTS migrations, run at startup.

use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables the callback service owns.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    create_tracks_table(pool).await?;
    create_track_versions_table(pool).await?;
    create_track_stems_table(pool).await?;
    create_webhook_deliveries_table(pool).await?;
    Ok(())
}

async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            provider TEXT NOT NULL,
            provider_task_id TEXT,
            audio_url TEXT,
            cover_url TEXT,
            video_url TEXT,
            lyrics TEXT,
            duration REAL,
            error_message TEXT,
            has_stems INTEGER NOT NULL DEFAULT 0,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tracks_provider_task
         ON tracks (provider, provider_task_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_status ON tracks (status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_track_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_versions (
            id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            variant_index INTEGER NOT NULL,
            audio_url TEXT,
            cover_url TEXT,
            video_url TEXT,
            source_audio_url TEXT,
            source_cover_url TEXT,
            duration REAL,
            clip_id TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (track_id, variant_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_track_stems_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_stems (
            id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            version_id TEXT REFERENCES track_versions(id) ON DELETE CASCADE,
            stem_type TEXT NOT NULL,
            separation_mode TEXT NOT NULL,
            audio_url TEXT NOT NULL,
            source_key TEXT,
            provider_task_id TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_track_stems_scope
         ON track_stems (track_id, separation_mode, version_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_webhook_deliveries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            webhook_id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            task_id TEXT NOT NULL,
            track_id TEXT,
            payload TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            received_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_task
         ON webhook_deliveries (provider, task_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_tables_is_idempotent() {
        let pool = tunesync_common::db::init_memory_pool().await.unwrap();
        init_tables(&pool).await.unwrap();
        init_tables(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
             AND name IN ('tracks', 'track_versions', 'track_stems', 'webhook_deliveries')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 4);
    }
}
