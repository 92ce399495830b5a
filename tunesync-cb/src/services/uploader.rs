//! Background upload fan-out
//!
//! Every variant a callback discovers is re-hosted to durable storage
//! and upserted into `track_versions`, detached from the webhook's
//! request lifecycle: the HTTP response never waits for an upload.
//! Per-variant failures are logged and isolated; one variant failing
//! never cancels the others, and the provider URL stays in place as the
//! playable fallback.

use crate::db::track_versions::{self, VersionUpsert};
use crate::services::storage::ObjectStorage;
use crate::types::CallbackVariant;
use futures::future::join_all;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fan-out persister for callback variants.
#[derive(Clone)]
pub struct VariantUploader {
    db: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    storage_prefix: String,
}

/// Outcome counts of one fan-out pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl VariantUploader {
    pub fn new(db: SqlitePool, storage: Arc<dyn ObjectStorage>, storage_prefix: String) -> Self {
        Self {
            db,
            storage,
            storage_prefix,
        }
    }

    /// Detach a fan-out over `variants`. Returns immediately; the spawned
    /// task completes or fails-and-logs on its own.
    pub fn spawn_fanout(&self, track_id: Uuid, user_id: String, variants: Vec<CallbackVariant>) {
        let uploader = self.clone();
        tokio::spawn(async move {
            let stats = uploader.persist_all(track_id, &user_id, &variants).await;
            info!(
                track_id = %track_id,
                uploaded = stats.uploaded,
                skipped = stats.skipped,
                failed = stats.failed,
                "Variant fan-out finished"
            );
        });
    }

    /// Persist every variant concurrently with all-settled semantics;
    /// concurrency is naturally capped by the variant count.
    pub async fn persist_all(
        &self,
        track_id: Uuid,
        user_id: &str,
        variants: &[CallbackVariant],
    ) -> FanoutStats {
        let results = join_all(
            variants
                .iter()
                .enumerate()
                .map(|(idx, variant)| self.persist_variant(track_id, user_id, idx as i64, variant)),
        )
        .await;

        let mut stats = FanoutStats::default();
        for outcome in results {
            match outcome {
                VariantOutcome::Uploaded => stats.uploaded += 1,
                VariantOutcome::Skipped => stats.skipped += 1,
                VariantOutcome::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Persist one variant. Idempotent per (track, variant_index): an
    /// already-durable row is left alone, so duplicate deliveries cost
    /// at most one upload attempt per variant.
    async fn persist_variant(
        &self,
        track_id: Uuid,
        user_id: &str,
        variant_index: i64,
        variant: &CallbackVariant,
    ) -> VariantOutcome {
        match track_versions::find_version(&self.db, track_id, variant_index).await {
            Ok(Some(existing)) => {
                let already_durable = existing
                    .audio_url
                    .as_deref()
                    .is_some_and(|url| url.starts_with(&self.storage_prefix));
                if already_durable {
                    debug!(
                        track_id = %track_id,
                        variant_index,
                        "Variant already uploaded; skipping"
                    );
                    return VariantOutcome::Skipped;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(track_id = %track_id, variant_index, error = %e, "Variant lookup failed");
                return VariantOutcome::Failed;
            }
        }

        let Some(audio_src) = variant.upload_source_url() else {
            debug!(track_id = %track_id, variant_index, "Variant has no audio URL; nothing to persist");
            return VariantOutcome::Skipped;
        };

        let file_base = if variant_index == 0 {
            "main".to_string()
        } else {
            format!("version-{variant_index}")
        };

        let mut upsert = VersionUpsert {
            source_audio_url: Some(audio_src.to_string()),
            source_cover_url: variant.image_url.clone(),
            video_url: variant.video_url.clone(),
            duration: variant.duration,
            clip_id: variant.id.clone(),
            ..Default::default()
        };

        let mut failed = false;
        match self
            .storage
            .upload_audio(
                audio_src,
                user_id,
                &track_id.to_string(),
                &format!("{file_base}.mp3"),
            )
            .await
        {
            Ok(storage_url) => {
                debug!(track_id = %track_id, variant_index, "Audio uploaded to storage");
                upsert.audio_url = Some(storage_url);
            }
            Err(e) => {
                warn!(
                    track_id = %track_id,
                    variant_index,
                    error = %e,
                    "Audio upload failed; keeping provider URL"
                );
                upsert.audio_url = Some(audio_src.to_string());
                failed = true;
            }
        }

        if let Some(cover_src) = variant.image_url.as_deref().filter(|s| !s.is_empty()) {
            match self
                .storage
                .upload_cover(
                    cover_src,
                    user_id,
                    &track_id.to_string(),
                    &format!("{file_base}-cover.webp"),
                )
                .await
            {
                Ok(storage_url) => upsert.cover_url = Some(storage_url),
                Err(e) => {
                    warn!(
                        track_id = %track_id,
                        variant_index,
                        error = %e,
                        "Cover upload failed; keeping provider URL"
                    );
                    upsert.cover_url = Some(cover_src.to_string());
                }
            }
        }

        if let Err(e) =
            track_versions::upsert_version(&self.db, track_id, variant_index, &upsert, &self.storage_prefix)
                .await
        {
            warn!(track_id = %track_id, variant_index, error = %e, "Variant upsert failed");
            return VariantOutcome::Failed;
        }

        if failed {
            VariantOutcome::Failed
        } else {
            VariantOutcome::Uploaded
        }
    }
}

enum VariantOutcome {
    Uploaded,
    Skipped,
    Failed,
}
