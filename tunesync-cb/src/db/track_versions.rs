//! Track version persistence
//!
//! One row per (track, variant_index); variant 0 is the primary version
//! that drives playback. Upserted by the background upload fan-out, so
//! writes are idempotent and storage URLs are never downgraded.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Track version record
#[derive(Debug, Clone)]
pub struct TrackVersion {
    pub id: Uuid,
    pub track_id: Uuid,
    pub variant_index: i64,
    pub audio_url: Option<String>,
    pub cover_url: Option<String>,
    pub video_url: Option<String>,
    pub source_audio_url: Option<String>,
    pub source_cover_url: Option<String>,
    pub duration: Option<f64>,
    pub clip_id: Option<String>,
}

/// Upsert payload for one reconciled variant.
#[derive(Debug, Clone, Default)]
pub struct VersionUpsert {
    pub audio_url: Option<String>,
    pub cover_url: Option<String>,
    pub video_url: Option<String>,
    pub source_audio_url: Option<String>,
    pub source_cover_url: Option<String>,
    pub duration: Option<f64>,
    pub clip_id: Option<String>,
}

fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> Result<TrackVersion> {
    let id_str: String = row.get("id");
    let track_id_str: String = row.get("track_id");
    Ok(TrackVersion {
        id: Uuid::parse_str(&id_str)?,
        track_id: Uuid::parse_str(&track_id_str)?,
        variant_index: row.get("variant_index"),
        audio_url: row.get("audio_url"),
        cover_url: row.get("cover_url"),
        video_url: row.get("video_url"),
        source_audio_url: row.get("source_audio_url"),
        source_cover_url: row.get("source_cover_url"),
        duration: row.get("duration"),
        clip_id: row.get("clip_id"),
    })
}

const VERSION_COLUMNS: &str = "id, track_id, variant_index, audio_url, cover_url, video_url, \
     source_audio_url, source_cover_url, duration, clip_id";

/// Upsert one variant row, unique on (track_id, variant_index).
///
/// On conflict, URL columns follow the same set-if-better rule as
/// tracks: an existing durable-storage URL survives an incoming
/// provider URL, and incoming NULLs never erase known values.
pub async fn upsert_version(
    pool: &SqlitePool,
    track_id: Uuid,
    variant_index: i64,
    upsert: &VersionUpsert,
    storage_prefix: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO track_versions (
            id, track_id, variant_index, audio_url, cover_url, video_url,
            source_audio_url, source_cover_url, duration, clip_id,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        ON CONFLICT (track_id, variant_index) DO UPDATE SET
            audio_url = CASE
                WHEN ?11 != '' AND track_versions.audio_url IS NOT NULL
                     AND track_versions.audio_url LIKE ?11 || '%'
                     AND NOT (COALESCE(excluded.audio_url, '') LIKE ?11 || '%')
                THEN track_versions.audio_url
                ELSE COALESCE(excluded.audio_url, track_versions.audio_url)
            END,
            cover_url = COALESCE(excluded.cover_url, track_versions.cover_url),
            video_url = COALESCE(excluded.video_url, track_versions.video_url),
            source_audio_url = COALESCE(excluded.source_audio_url, track_versions.source_audio_url),
            source_cover_url = COALESCE(excluded.source_cover_url, track_versions.source_cover_url),
            duration = COALESCE(excluded.duration, track_versions.duration),
            clip_id = COALESCE(excluded.clip_id, track_versions.clip_id),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(track_id.to_string())
    .bind(variant_index)
    .bind(&upsert.audio_url)
    .bind(&upsert.cover_url)
    .bind(&upsert.video_url)
    .bind(&upsert.source_audio_url)
    .bind(&upsert.source_cover_url)
    .bind(upsert.duration)
    .bind(&upsert.clip_id)
    .bind(storage_prefix)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one variant of a track.
pub async fn find_version(
    pool: &SqlitePool,
    track_id: Uuid,
    variant_index: i64,
) -> Result<Option<TrackVersion>> {
    let row = sqlx::query(&format!(
        "SELECT {VERSION_COLUMNS} FROM track_versions WHERE track_id = ? AND variant_index = ?"
    ))
    .bind(track_id.to_string())
    .bind(variant_index)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_version).transpose()
}

/// Load a version by primary key (used by the pull-based stem resync).
pub async fn find_by_id(pool: &SqlitePool, version_id: Uuid) -> Result<Option<TrackVersion>> {
    let row = sqlx::query(&format!(
        "SELECT {VERSION_COLUMNS} FROM track_versions WHERE id = ?"
    ))
    .bind(version_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_version).transpose()
}

/// All variants of a track, primary first.
pub async fn list_for_track(pool: &SqlitePool, track_id: Uuid) -> Result<Vec<TrackVersion>> {
    let rows = sqlx::query(&format!(
        "SELECT {VERSION_COLUMNS} FROM track_versions WHERE track_id = ? ORDER BY variant_index"
    ))
    .bind(track_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_version).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tracks::{insert_track, Track};

    const STORAGE: &str = "https://storage.example/media";

    async fn test_pool_with_track() -> (SqlitePool, Uuid) {
        let pool = tunesync_common::db::init_memory_pool().await.unwrap();
        crate::db::schema::init_tables(&pool).await.unwrap();
        let track = Track::new("user-1", "musegen", "task-1");
        insert_track(&pool, &track).await.unwrap();
        (pool, track.id)
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates_in_place() {
        let (pool, track_id) = test_pool_with_track().await;

        let first = VersionUpsert {
            audio_url: Some("https://cdn.provider/a.mp3".to_string()),
            clip_id: Some("clip-1".to_string()),
            ..Default::default()
        };
        upsert_version(&pool, track_id, 0, &first, STORAGE).await.unwrap();

        let second = VersionUpsert {
            audio_url: Some(format!("{STORAGE}/t/main.mp3")),
            duration: Some(93.0),
            ..Default::default()
        };
        upsert_version(&pool, track_id, 0, &second, STORAGE).await.unwrap();

        let rows = list_for_track(&pool, track_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].audio_url.as_deref(), Some("https://storage.example/media/t/main.mp3"));
        // Conflict update keeps columns the second write omitted
        assert_eq!(rows[0].clip_id.as_deref(), Some("clip-1"));
        assert_eq!(rows[0].duration, Some(93.0));
    }

    #[tokio::test]
    async fn test_upsert_never_downgrades_storage_url() {
        let (pool, track_id) = test_pool_with_track().await;

        let durable = VersionUpsert {
            audio_url: Some(format!("{STORAGE}/t/main.mp3")),
            ..Default::default()
        };
        upsert_version(&pool, track_id, 0, &durable, STORAGE).await.unwrap();

        // Duplicate delivery re-runs the provider-URL upsert
        let provider = VersionUpsert {
            audio_url: Some("https://cdn.provider/a.mp3".to_string()),
            source_audio_url: Some("https://cdn.provider/a.mp3".to_string()),
            ..Default::default()
        };
        upsert_version(&pool, track_id, 0, &provider, STORAGE).await.unwrap();

        let version = find_version(&pool, track_id, 0).await.unwrap().unwrap();
        assert_eq!(
            version.audio_url.as_deref(),
            Some("https://storage.example/media/t/main.mp3")
        );
        assert_eq!(
            version.source_audio_url.as_deref(),
            Some("https://cdn.provider/a.mp3")
        );
    }

    #[tokio::test]
    async fn test_variants_are_distinct_rows() {
        let (pool, track_id) = test_pool_with_track().await;

        for idx in 0..3 {
            let upsert = VersionUpsert {
                audio_url: Some(format!("https://cdn.provider/v{idx}.mp3")),
                ..Default::default()
            };
            upsert_version(&pool, track_id, idx, &upsert, STORAGE).await.unwrap();
        }

        let rows = list_for_track(&pool, track_id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].variant_index, 0);
        assert_eq!(rows[2].variant_index, 2);
    }
}
