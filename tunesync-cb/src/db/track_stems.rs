//! Stem asset persistence
//!
//! Stem rows for one (track, separation_mode, version) scope are always
//! replaced wholesale: delete-then-insert, never patched. A retried
//! separation with a different asset count must not leave orphans from
//! a prior, differently-shaped result.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Stem asset record
#[derive(Debug, Clone)]
pub struct TrackStem {
    pub id: Uuid,
    pub track_id: Uuid,
    pub version_id: Option<Uuid>,
    pub stem_type: String,
    pub separation_mode: String,
    pub audio_url: String,
    pub source_key: Option<String>,
    pub provider_task_id: Option<String>,
}

/// One row to insert during a replace.
#[derive(Debug, Clone)]
pub struct StemInsert {
    pub stem_type: String,
    pub audio_url: String,
    pub source_key: Option<String>,
}

/// Replace every stem row in the (track, separation_mode, version)
/// scope with `stems`. Runs in one transaction so readers never observe
/// a half-replaced set.
pub async fn replace_stems(
    pool: &SqlitePool,
    track_id: Uuid,
    version_id: Option<Uuid>,
    separation_mode: &str,
    provider_task_id: &str,
    stems: &[StemInsert],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let delete = if version_id.is_some() {
        sqlx::query(
            "DELETE FROM track_stems
             WHERE track_id = ? AND separation_mode = ? AND version_id = ?",
        )
        .bind(track_id.to_string())
        .bind(separation_mode)
        .bind(version_id.map(|id| id.to_string()))
    } else {
        sqlx::query(
            "DELETE FROM track_stems
             WHERE track_id = ? AND separation_mode = ? AND version_id IS NULL",
        )
        .bind(track_id.to_string())
        .bind(separation_mode)
    };
    delete.execute(&mut *tx).await?;

    for stem in stems {
        sqlx::query(
            r#"
            INSERT INTO track_stems (
                id, track_id, version_id, stem_type, separation_mode,
                audio_url, source_key, provider_task_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(track_id.to_string())
        .bind(version_id.map(|id| id.to_string()))
        .bind(&stem.stem_type)
        .bind(separation_mode)
        .bind(&stem.audio_url)
        .bind(&stem.source_key)
        .bind(provider_task_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// All stems in one scope, for assertions and API reads.
pub async fn list_stems(
    pool: &SqlitePool,
    track_id: Uuid,
    separation_mode: &str,
    version_id: Option<Uuid>,
) -> Result<Vec<TrackStem>> {
    let query = if version_id.is_some() {
        sqlx::query(
            "SELECT id, track_id, version_id, stem_type, separation_mode, audio_url,
                    source_key, provider_task_id
             FROM track_stems
             WHERE track_id = ? AND separation_mode = ? AND version_id = ?
             ORDER BY stem_type",
        )
        .bind(track_id.to_string())
        .bind(separation_mode)
        .bind(version_id.map(|id| id.to_string()))
    } else {
        sqlx::query(
            "SELECT id, track_id, version_id, stem_type, separation_mode, audio_url,
                    source_key, provider_task_id
             FROM track_stems
             WHERE track_id = ? AND separation_mode = ? AND version_id IS NULL
             ORDER BY stem_type",
        )
        .bind(track_id.to_string())
        .bind(separation_mode)
    };

    let rows = query.fetch_all(pool).await?;

    rows.iter()
        .map(|row| {
            let id_str: String = row.get("id");
            let track_id_str: String = row.get("track_id");
            let version_id_str: Option<String> = row.get("version_id");
            Ok(TrackStem {
                id: Uuid::parse_str(&id_str)?,
                track_id: Uuid::parse_str(&track_id_str)?,
                version_id: version_id_str.map(|s| Uuid::parse_str(&s)).transpose()?,
                stem_type: row.get("stem_type"),
                separation_mode: row.get("separation_mode"),
                audio_url: row.get("audio_url"),
                source_key: row.get("source_key"),
                provider_task_id: row.get("provider_task_id"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tracks::{insert_track, Track};

    async fn test_pool_with_track() -> (SqlitePool, Uuid) {
        let pool = tunesync_common::db::init_memory_pool().await.unwrap();
        crate::db::schema::init_tables(&pool).await.unwrap();
        let track = Track::new("user-1", "musegen", "task-1");
        insert_track(&pool, &track).await.unwrap();
        (pool, track.id)
    }

    fn stem(stem_type: &str) -> StemInsert {
        StemInsert {
            stem_type: stem_type.to_string(),
            audio_url: format!("https://cdn.provider/{stem_type}.mp3"),
            source_key: Some(format!("{stem_type}Url")),
        }
    }

    #[tokio::test]
    async fn test_replace_is_delete_then_insert() {
        let (pool, track_id) = test_pool_with_track().await;

        let four: Vec<StemInsert> = ["vocals", "drums", "bass", "other"]
            .iter()
            .map(|t| stem(t))
            .collect();
        replace_stems(&pool, track_id, None, "split_stem", "st-1", &four)
            .await
            .unwrap();
        assert_eq!(list_stems(&pool, track_id, "split_stem", None).await.unwrap().len(), 4);

        // Retried separation comes back with a smaller shape
        let two: Vec<StemInsert> = ["vocals", "instrumental"].iter().map(|t| stem(t)).collect();
        replace_stems(&pool, track_id, None, "split_stem", "st-2", &two)
            .await
            .unwrap();

        let rows = list_stems(&pool, track_id, "split_stem", None).await.unwrap();
        assert_eq!(rows.len(), 2, "exactly the new shape, never 4 or 6");
        assert!(rows.iter().all(|r| r.provider_task_id.as_deref() == Some("st-2")));
    }

    #[tokio::test]
    async fn test_replace_scopes_by_mode_and_version() {
        let (pool, track_id) = test_pool_with_track().await;

        replace_stems(&pool, track_id, None, "separate_vocal", "st-1", &[stem("vocals")])
            .await
            .unwrap();
        replace_stems(&pool, track_id, None, "split_stem", "st-2", &[stem("drums"), stem("bass")])
            .await
            .unwrap();

        // Replacing one mode leaves the other untouched
        replace_stems(&pool, track_id, None, "separate_vocal", "st-3", &[stem("original")])
            .await
            .unwrap();

        assert_eq!(
            list_stems(&pool, track_id, "separate_vocal", None).await.unwrap().len(),
            1
        );
        assert_eq!(
            list_stems(&pool, track_id, "split_stem", None).await.unwrap().len(),
            2
        );
    }
}
