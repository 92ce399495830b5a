//! Callback state machine
//!
//! Per-(task, stage) transition logic for generation callbacks:
//!
//! - make the first available variant playable immediately,
//! - refresh the version cache so later stages whose payload omits
//!   variant data can still reconcile,
//! - detach the durable upload fan-out from the request lifecycle,
//! - on the terminal `complete` stage, finalize the track with the
//!   durable variant-0 URL when the upload already landed, else the
//!   fast-path URL.
//!
//! Stages arrive in any order; each stage independently derives its
//! variant data from the payload or the cache, so `complete` never
//! assumes `first` ran.

use crate::db::{track_versions, tracks};
use crate::services::stems::sanitize_stem_text;
use crate::services::uploader::VariantUploader;
use crate::types::{CallbackEnvelope, CallbackType, CallbackVariant};
use anyhow::Result;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};
use tunesync_common::cache::TtlCache;
use uuid::Uuid;

/// Variant arrays are bridged across stages for half an hour; a task
/// that stays silent longer than that has timed out anyway.
pub const VERSION_CACHE_TTL: Duration = Duration::from_secs(1800);

/// Task id → last-seen variant array. Never authoritative, only a
/// fallback for stages whose payload omits variant data.
pub type VersionCache = TtlCache<String, Vec<CallbackVariant>>;

/// What processing one callback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Payload carried no task id; nothing to correlate against
    MissingTaskId,
    /// No track owns this task yet (provider beat the record commit);
    /// the caller answers retryable 202
    TrackNotFound,
    /// Side effects applied
    Applied {
        track_id: Uuid,
        stage: CallbackType,
        /// Variant data came from the version cache, not the payload
        cached: bool,
    },
}

/// Callback state machine over one provider's tasks.
#[derive(Clone)]
pub struct CallbackProcessor {
    db: SqlitePool,
    version_cache: VersionCache,
    uploader: VariantUploader,
    provider: String,
    storage_prefix: String,
}

impl CallbackProcessor {
    pub fn new(
        db: SqlitePool,
        version_cache: VersionCache,
        uploader: VariantUploader,
        provider: String,
        storage_prefix: String,
    ) -> Self {
        Self {
            db,
            version_cache,
            uploader,
            provider,
            storage_prefix,
        }
    }

    /// Apply one callback's side effects. Idempotency is the caller's
    /// job (the delivery ledger); this function assumes it runs at most
    /// once per delivery and keeps every write convergent anyway.
    pub async fn process(&self, envelope: &CallbackEnvelope) -> Result<ProcessOutcome> {
        let Some(task_id) = envelope.task_id() else {
            warn!("Callback without task id");
            return Ok(ProcessOutcome::MissingTaskId);
        };
        let task_id = task_id.to_string();
        let stage = envelope.callback_type();

        let Some(track) = tracks::find_by_task_id(&self.db, &self.provider, &task_id).await? else {
            warn!(task_id, stage = %stage, "No track found for task");
            return Ok(ProcessOutcome::TrackNotFound);
        };

        let stage_markers = json!({
            "callback_stage": stage.as_str(),
            "last_callback_code": envelope.code,
            "last_callback_msg": envelope.msg,
        });

        // Provider-reported failure is terminal from any state; handling
        // it is still a successful delivery
        if envelope.is_provider_error() {
            let reason = envelope
                .msg
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or("generation failed");
            let metadata = track.merged_metadata(&stage_markers);
            let metadata = merge(&metadata, &json!({"error": "callback_error"}));
            tracks::mark_failed(&self.db, track.id, &sanitize_stem_text(reason, 500), &metadata)
                .await?;

            warn!(
                track_id = %track.id,
                task_id,
                code = ?envelope.code,
                stage = %stage,
                "Callback reported error; track marked failed"
            );
            return Ok(ProcessOutcome::Applied {
                track_id: track.id,
                stage: CallbackType::Error,
                cached: false,
            });
        }

        // Variant data: payload wins; an empty payload falls back to the
        // cached array from an earlier stage of the same task
        let payload_variants = envelope
            .data
            .as_ref()
            .and_then(|d| d.data.clone())
            .filter(|v| !v.is_empty());
        let mut cached = false;
        let versions = match payload_variants {
            Some(v) => v,
            None => match self.version_cache.get(&task_id).await {
                Some(v) => {
                    info!(task_id, count = v.len(), "Using cached versions");
                    cached = true;
                    v
                }
                None => Vec::new(),
            },
        };

        // No variants anywhere: an early stage marker (text, or a bare
        // first/complete echo). Record progress and stop.
        if versions.is_empty() {
            info!(track_id = %track.id, stage = %stage, "No variant data yet; stage marker only");
            let metadata = track.merged_metadata(&stage_markers);
            tracks::update_metadata(&self.db, track.id, &metadata).await?;
            return Ok(ProcessOutcome::Applied {
                track_id: track.id,
                stage,
                cached,
            });
        }

        self.version_cache
            .set_with_ttl(task_id.clone(), versions.clone(), VERSION_CACHE_TTL)
            .await;

        // Immediate playback from the primary variant
        let first = &versions[0];
        let immediate_url = first.immediate_url().map(str::to_string);

        if let Some(ref url) = immediate_url {
            let update = tracks::ImmediateUpdate {
                audio_url: url.clone(),
                cover_url: first.image_url.clone().filter(|s| !s.is_empty()),
                video_url: first.video_url.clone().filter(|s| !s.is_empty()),
                lyrics: first
                    .prompt
                    .as_deref()
                    .map(|p| sanitize_stem_text(p, 10_000))
                    .filter(|s| !s.is_empty()),
                duration: first.duration,
                title: first
                    .title
                    .as_deref()
                    .map(|t| sanitize_stem_text(t, 500))
                    .filter(|s| !s.is_empty()),
            };
            let metadata = track.merged_metadata(&stage_markers);
            let metadata = merge(
                &metadata,
                &json!({
                    "variant_snapshot": versions,
                    "immediate_play_ready": true,
                }),
            );
            tracks::apply_immediate_update(
                &self.db,
                track.id,
                &update,
                &metadata,
                &self.storage_prefix,
            )
            .await?;

            info!(
                track_id = %track.id,
                stage = %stage,
                variants = versions.len(),
                "Immediate playback prepared"
            );
        }

        // Durable persistence happens off the request path
        self.uploader
            .spawn_fanout(track.id, track.user_id.clone(), versions.clone());

        // Terminal stage: finalize from a best-effort snapshot. Uploads
        // may land after we return 200; the provider's timeout makes
        // waiting for them infeasible.
        if stage == CallbackType::Complete {
            if let Err(e) = self
                .finalize(&track, &versions, immediate_url.as_deref())
                .await
            {
                warn!(track_id = %track.id, error = %e, "Finalization failed");
            }
        }

        Ok(ProcessOutcome::Applied {
            track_id: track.id,
            stage,
            cached,
        })
    }

    async fn finalize(
        &self,
        track: &tracks::Track,
        versions: &[CallbackVariant],
        immediate_url: Option<&str>,
    ) -> Result<()> {
        let main_version = track_versions::find_version(&self.db, track.id, 0).await?;

        let durable_audio = main_version
            .as_ref()
            .and_then(|v| v.audio_url.as_deref())
            .filter(|url| url.starts_with(&self.storage_prefix))
            .map(str::to_string);
        let durable_cover = main_version
            .as_ref()
            .and_then(|v| v.cover_url.as_deref())
            .filter(|url| url.starts_with(&self.storage_prefix))
            .map(str::to_string);

        let final_audio = durable_audio
            .or_else(|| immediate_url.map(str::to_string))
            .or_else(|| track.audio_url.clone());
        let final_cover = durable_cover
            .or_else(|| versions[0].image_url.clone().filter(|s| !s.is_empty()))
            .or_else(|| track.cover_url.clone());

        let metadata = track.merged_metadata(&json!({
            "callback_stage": CallbackType::Complete.as_str(),
            "completed_at": chrono::Utc::now().to_rfc3339(),
            "variant_snapshot": versions,
            "immediate_play_ready": true,
        }));

        tracks::finalize_completed(
            &self.db,
            track.id,
            final_audio.as_deref(),
            final_cover.as_deref(),
            &metadata,
            &self.storage_prefix,
        )
        .await?;

        info!(track_id = %track.id, "Track finalized on complete");
        Ok(())
    }
}

fn merge(base: &Value, patch: &Value) -> Value {
    let mut merged = match base {
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
