//! Track persistence
//!
//! Tracks are created when the owning application accepts a generation
//! request; every callback mutates them afterwards. URL columns are
//! written set-if-better: a durable-storage URL is never replaced by a
//! raw provider URL, so concurrent stages converge instead of clobbering
//! each other.

use crate::types::TrackStatus;
use anyhow::Result;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Track record
#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub user_id: String,
    pub title: Option<String>,
    pub status: TrackStatus,
    pub provider: String,
    pub provider_task_id: Option<String>,
    pub audio_url: Option<String>,
    pub cover_url: Option<String>,
    pub video_url: Option<String>,
    pub lyrics: Option<String>,
    pub duration: Option<f64>,
    pub error_message: Option<String>,
    pub has_stems: bool,
    /// Stage markers, last-callback info, raw variant snapshot
    pub metadata: Value,
}

impl Track {
    /// New pending track for a submitted generation task.
    pub fn new(user_id: &str, provider: &str, provider_task_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: None,
            status: TrackStatus::Pending,
            provider: provider.to_string(),
            provider_task_id: Some(provider_task_id.to_string()),
            audio_url: None,
            cover_url: None,
            video_url: None,
            lyrics: None,
            duration: None,
            error_message: None,
            has_stems: false,
            metadata: Value::Object(Default::default()),
        }
    }

    /// Merge `patch`'s top-level keys into this track's metadata object.
    pub fn merged_metadata(&self, patch: &Value) -> Value {
        let mut merged = match &self.metadata {
            Value::Object(map) => map.clone(),
            _ => Default::default(),
        };
        if let Value::Object(patch_map) = patch {
            for (k, v) in patch_map {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }
}

fn row_to_track(row: &sqlx::sqlite::SqliteRow) -> Result<Track> {
    let id_str: String = row.get("id");
    let status_str: String = row.get("status");
    let metadata_str: Option<String> = row.get("metadata");
    let has_stems: i64 = row.get("has_stems");

    Ok(Track {
        id: Uuid::parse_str(&id_str)?,
        user_id: row.get("user_id"),
        title: row.get("title"),
        status: TrackStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown track status: {status_str}"))?,
        provider: row.get("provider"),
        provider_task_id: row.get("provider_task_id"),
        audio_url: row.get("audio_url"),
        cover_url: row.get("cover_url"),
        video_url: row.get("video_url"),
        lyrics: row.get("lyrics"),
        duration: row.get("duration"),
        error_message: row.get("error_message"),
        has_stems: has_stems != 0,
        metadata: metadata_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| Value::Object(Default::default())),
    })
}

const TRACK_COLUMNS: &str = "id, user_id, title, status, provider, provider_task_id, \
     audio_url, cover_url, video_url, lyrics, duration, error_message, has_stems, metadata";

/// Save a new track.
pub async fn insert_track(pool: &SqlitePool, track: &Track) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tracks (
            id, user_id, title, status, provider, provider_task_id,
            audio_url, cover_url, video_url, lyrics, duration,
            error_message, has_stems, metadata, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        "#,
    )
    .bind(track.id.to_string())
    .bind(&track.user_id)
    .bind(&track.title)
    .bind(track.status.as_str())
    .bind(&track.provider)
    .bind(&track.provider_task_id)
    .bind(&track.audio_url)
    .bind(&track.cover_url)
    .bind(&track.video_url)
    .bind(&track.lyrics)
    .bind(track.duration)
    .bind(&track.error_message)
    .bind(track.has_stems as i64)
    .bind(track.metadata.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Locate the track owning a provider task. The provider may call back
/// before the owning record commits, so `None` here means retry-later,
/// not an error.
pub async fn find_by_task_id(
    pool: &SqlitePool,
    provider: &str,
    task_id: &str,
) -> Result<Option<Track>> {
    let row = sqlx::query(&format!(
        "SELECT {TRACK_COLUMNS} FROM tracks WHERE provider = ? AND provider_task_id = ?"
    ))
    .bind(provider)
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_track).transpose()
}

/// Locate the track whose metadata records a stem separation task.
/// Stem task ids live in metadata because separation is requested per
/// track (or per version) after generation, not at creation time.
pub async fn find_by_stem_task_id(pool: &SqlitePool, task_id: &str) -> Result<Option<Track>> {
    let row = sqlx::query(&format!(
        "SELECT {TRACK_COLUMNS} FROM tracks
         WHERE json_extract(metadata, '$.stem_task_id') = ?"
    ))
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_track).transpose()
}

/// Load a track by primary key.
pub async fn find_by_id(pool: &SqlitePool, track_id: Uuid) -> Result<Option<Track>> {
    let row = sqlx::query(&format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?"))
        .bind(track_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_track).transpose()
}

/// Persist a stage marker without touching playback state (text stage,
/// unknown stages, empty-variant callbacks).
pub async fn update_metadata(pool: &SqlitePool, track_id: Uuid, metadata: &Value) -> Result<()> {
    sqlx::query("UPDATE tracks SET metadata = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(metadata.to_string())
        .bind(track_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Mark a track failed with the provider's reason.
pub async fn mark_failed(
    pool: &SqlitePool,
    track_id: Uuid,
    error_message: &str,
    metadata: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tracks
        SET status = 'failed',
            error_message = ?,
            metadata = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(error_message)
    .bind(metadata.to_string())
    .bind(track_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fields applied when a callback makes a variant immediately playable.
#[derive(Debug, Clone, Default)]
pub struct ImmediateUpdate {
    pub audio_url: String,
    pub cover_url: Option<String>,
    pub video_url: Option<String>,
    pub lyrics: Option<String>,
    pub duration: Option<f64>,
    pub title: Option<String>,
}

/// Make the first available variant playable.
///
/// `audio_url` is guarded by the durable-storage prefix: an existing
/// storage URL stays, otherwise the incoming URL wins. Status moves to
/// `processing` unless the track already completed. Secondary fields
/// only fill gaps (COALESCE keeps existing values).
pub async fn apply_immediate_update(
    pool: &SqlitePool,
    track_id: Uuid,
    update: &ImmediateUpdate,
    metadata: &Value,
    storage_prefix: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tracks
        SET status = CASE WHEN status = 'completed' THEN 'completed' ELSE 'processing' END,
            audio_url = CASE
                WHEN ?1 != '' AND audio_url IS NOT NULL AND audio_url LIKE ?1 || '%' THEN audio_url
                ELSE ?2
            END,
            cover_url = COALESCE(?3, cover_url),
            video_url = COALESCE(?4, video_url),
            lyrics = COALESCE(?5, lyrics),
            duration = COALESCE(?6, duration),
            title = COALESCE(title, ?7),
            metadata = ?8,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?9
        "#,
    )
    .bind(storage_prefix)
    .bind(&update.audio_url)
    .bind(&update.cover_url)
    .bind(&update.video_url)
    .bind(&update.lyrics)
    .bind(update.duration)
    .bind(&update.title)
    .bind(metadata.to_string())
    .bind(track_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Finalize a track on the terminal `complete` stage. The caller has
/// already chosen the best audio/cover URLs (durable if uploaded, else
/// the immediate fallback); the storage-prefix guard still protects an
/// already-upgraded URL against a stale fallback.
pub async fn finalize_completed(
    pool: &SqlitePool,
    track_id: Uuid,
    final_audio_url: Option<&str>,
    final_cover_url: Option<&str>,
    metadata: &Value,
    storage_prefix: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tracks
        SET status = 'completed',
            audio_url = CASE
                WHEN ?2 IS NULL THEN audio_url
                WHEN ?1 != '' AND audio_url IS NOT NULL AND audio_url LIKE ?1 || '%'
                     AND NOT (?2 LIKE ?1 || '%') THEN audio_url
                ELSE ?2
            END,
            cover_url = COALESCE(?3, cover_url),
            metadata = ?4,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?5
        "#,
    )
    .bind(storage_prefix)
    .bind(final_audio_url)
    .bind(final_cover_url)
    .bind(metadata.to_string())
    .bind(track_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Flag stem availability after a successful stem reconciliation.
pub async fn set_has_stems(pool: &SqlitePool, track_id: Uuid, metadata: &Value) -> Result<()> {
    sqlx::query(
        "UPDATE tracks SET has_stems = 1, metadata = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(metadata.to_string())
    .bind(track_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fail `processing` tracks older than `cutoff_hours` (generation jobs
/// that will never call back). Returns how many were failed.
pub async fn fail_stuck_processing(pool: &SqlitePool, cutoff_hours: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tracks
        SET status = 'failed',
            error_message = 'generation timeout',
            updated_at = CURRENT_TIMESTAMP
        WHERE status = 'processing'
          AND updated_at < datetime('now', ?)
        "#,
    )
    .bind(format!("-{cutoff_hours} hours"))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> SqlitePool {
        let pool = tunesync_common::db::init_memory_pool().await.unwrap();
        crate::db::schema::init_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_insert_and_find_by_task_id() {
        let pool = test_pool().await;
        let track = Track::new("user-1", "musegen", "task-1");
        insert_track(&pool, &track).await.unwrap();

        let found = find_by_task_id(&pool, "musegen", "task-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, track.id);
        assert_eq!(found.status, TrackStatus::Pending);

        assert!(find_by_task_id(&pool, "musegen", "other")
            .await
            .unwrap()
            .is_none());
        assert!(find_by_task_id(&pool, "elsewhere", "task-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_immediate_update_sets_url_and_status() {
        let pool = test_pool().await;
        let track = Track::new("user-1", "musegen", "task-1");
        insert_track(&pool, &track).await.unwrap();

        let update = ImmediateUpdate {
            audio_url: "https://cdn.provider/stream.mp3".to_string(),
            cover_url: Some("https://cdn.provider/cover.jpg".to_string()),
            duration: Some(120.0),
            ..Default::default()
        };
        apply_immediate_update(
            &pool,
            track.id,
            &update,
            &json!({"immediate_play_ready": true}),
            "https://storage.example/media",
        )
        .await
        .unwrap();

        let found = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(found.status, TrackStatus::Processing);
        assert_eq!(found.audio_url.as_deref(), Some("https://cdn.provider/stream.mp3"));
        assert_eq!(found.metadata["immediate_play_ready"], json!(true));
    }

    #[tokio::test]
    async fn test_immediate_update_never_downgrades_storage_url() {
        let pool = test_pool().await;
        let mut track = Track::new("user-1", "musegen", "task-1");
        track.audio_url = Some("https://storage.example/media/t/main.mp3".to_string());
        insert_track(&pool, &track).await.unwrap();

        let update = ImmediateUpdate {
            audio_url: "https://cdn.provider/stream.mp3".to_string(),
            ..Default::default()
        };
        apply_immediate_update(
            &pool,
            track.id,
            &update,
            &json!({}),
            "https://storage.example/media",
        )
        .await
        .unwrap();

        let found = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(
            found.audio_url.as_deref(),
            Some("https://storage.example/media/t/main.mp3")
        );
    }

    #[tokio::test]
    async fn test_finalize_prefers_storage_url_over_stale_fallback() {
        let pool = test_pool().await;
        let mut track = Track::new("user-1", "musegen", "task-1");
        track.audio_url = Some("https://storage.example/media/t/main.mp3".to_string());
        insert_track(&pool, &track).await.unwrap();

        // A complete stage whose snapshot predates the upload must not
        // downgrade the already-durable URL
        finalize_completed(
            &pool,
            track.id,
            Some("https://cdn.provider/full.mp3"),
            None,
            &json!({}),
            "https://storage.example/media",
        )
        .await
        .unwrap();

        let found = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(found.status, TrackStatus::Completed);
        assert_eq!(
            found.audio_url.as_deref(),
            Some("https://storage.example/media/t/main.mp3")
        );
    }

    #[tokio::test]
    async fn test_mark_failed() {
        let pool = test_pool().await;
        let track = Track::new("user-1", "musegen", "task-2");
        insert_track(&pool, &track).await.unwrap();

        mark_failed(&pool, track.id, "boom", &json!({"error": "callback_error"}))
            .await
            .unwrap();

        let found = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(found.status, TrackStatus::Failed);
        assert_eq!(found.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_fail_stuck_processing_only_hits_old_rows() {
        let pool = test_pool().await;
        let track = Track::new("user-1", "musegen", "task-3");
        insert_track(&pool, &track).await.unwrap();
        sqlx::query("UPDATE tracks SET status = 'processing', updated_at = datetime('now', '-4 hours') WHERE id = ?")
            .bind(track.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let fresh = Track::new("user-1", "musegen", "task-4");
        insert_track(&pool, &fresh).await.unwrap();
        sqlx::query("UPDATE tracks SET status = 'processing' WHERE id = ?")
            .bind(fresh.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let failed = fail_stuck_processing(&pool, 3).await.unwrap();
        assert_eq!(failed, 1);

        let stuck = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, TrackStatus::Failed);
        let alive = find_by_id(&pool, fresh.id).await.unwrap().unwrap();
        assert_eq!(alive.status, TrackStatus::Processing);
    }

    #[test]
    fn test_merged_metadata_overrides_and_keeps() {
        let mut track = Track::new("u", "musegen", "t");
        track.metadata = json!({"a": 1, "b": 2});
        let merged = track.merged_metadata(&json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }
}
