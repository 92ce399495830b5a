//! Stem reconciliation
//!
//! Two entry points converge on identical end-state: the provider's
//! pushed stem callback, and the client-initiated resync used when no
//! callback arrives in time. Both run normalize → delete-old →
//! insert-new; delete-then-insert is deliberate, because a retried
//! separation with a different asset count must not leave orphaned rows
//! from a prior, differently-shaped result.

use crate::db::{track_stems, track_versions, tracks};
use crate::services::provider::{ProviderApi, ProviderError, StemTaskStatus};
use crate::services::stems::{
    determine_separation_mode, extract_assets, sanitize_stem_text, StemAsset,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Reconciler errors surfaced to the API layer.
#[derive(Debug, Error)]
pub enum StemSyncError {
    #[error("Track not found: {0}")]
    TrackNotFound(Uuid),

    #[error("Version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("Version {version_id} does not belong to track {track_id}")]
    VersionMismatch { track_id: Uuid, version_id: Uuid },

    #[error("Could not determine the stem task for track {0}")]
    MissingTaskId(Uuid),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Client request for a pull-based resync.
#[derive(Debug, Clone, Default)]
pub struct StemSyncRequest {
    pub track_id: Uuid,
    pub version_id: Option<Uuid>,
    pub task_id: Option<String>,
    pub separation_mode: Option<String>,
    pub force_refresh: bool,
}

/// End state after one reconciliation pass.
#[derive(Debug, Clone)]
pub struct StemSyncOutcome {
    pub track_id: Uuid,
    pub version_id: Option<Uuid>,
    pub task_id: String,
    pub separation_mode: String,
    pub assets: usize,
    pub status: String,
    pub code: Option<i64>,
    pub message: Option<String>,
}

/// Push/pull stem reconciler.
#[derive(Clone)]
pub struct StemReconciler {
    db: SqlitePool,
    provider: Arc<dyn ProviderApi>,
}

impl StemReconciler {
    pub fn new(db: SqlitePool, provider: Arc<dyn ProviderApi>) -> Self {
        Self { db, provider }
    }

    /// Pull path: query the provider's task status directly and apply
    /// the same replace logic as the push path.
    pub async fn sync_from_provider(
        &self,
        request: &StemSyncRequest,
    ) -> Result<StemSyncOutcome, StemSyncError> {
        let track = tracks::find_by_id(&self.db, request.track_id)
            .await?
            .ok_or(StemSyncError::TrackNotFound(request.track_id))?;

        let version = match request.version_id {
            Some(version_id) => {
                let version = track_versions::find_by_id(&self.db, version_id)
                    .await?
                    .ok_or(StemSyncError::VersionNotFound(version_id))?;
                if version.track_id != track.id {
                    return Err(StemSyncError::VersionMismatch {
                        track_id: track.id,
                        version_id,
                    });
                }
                Some(version)
            }
            None => None,
        };

        let stored_task_id = track
            .metadata
            .get("stem_task_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let task_id = request
            .task_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or(stored_task_id)
            .ok_or(StemSyncError::MissingTaskId(track.id))?;

        let stored_mode = track
            .metadata
            .get("stem_separation_mode")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let requested_mode = request.separation_mode.clone().or(stored_mode);

        // A completed separation does not need another provider round
        // trip unless the caller forces one
        if !request.force_refresh {
            let already_completed = track
                .metadata
                .get("stem_task_status")
                .and_then(|v| v.as_str())
                == Some("completed");
            if already_completed && track.has_stems {
                let mode = requested_mode
                    .as_deref()
                    .unwrap_or(crate::services::stems::MODE_SEPARATE_VOCAL)
                    .to_string();
                let existing =
                    track_stems::list_stems(&self.db, track.id, &mode, request.version_id).await?;
                if !existing.is_empty() {
                    info!(track_id = %track.id, "Stems already reconciled; skipping provider query");
                    return Ok(StemSyncOutcome {
                        track_id: track.id,
                        version_id: request.version_id,
                        task_id,
                        separation_mode: mode,
                        assets: existing.len(),
                        status: "completed".to_string(),
                        code: None,
                        message: None,
                    });
                }
            }
        }

        let status = self.provider.query_stem_task(&task_id).await?;

        self.apply(&track, version.map(|v| v.id), &status, requested_mode.as_deref())
            .await
    }

    /// Push path: the provider's stem callback carries the task state
    /// inline; correlate by stem task id and apply.
    pub async fn apply_callback(
        &self,
        status: &StemTaskStatus,
        requested_mode: Option<&str>,
    ) -> Result<Option<StemSyncOutcome>, StemSyncError> {
        let Some(track) = tracks::find_by_stem_task_id(&self.db, &status.task_id).await? else {
            warn!(task_id = status.task_id, "No track found for stem task");
            return Ok(None);
        };

        let version_id = track
            .metadata
            .get("stem_version_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        let stored_mode = track
            .metadata
            .get("stem_separation_mode")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let outcome = self
            .apply(
                &track,
                version_id,
                status,
                requested_mode.or(stored_mode.as_deref()),
            )
            .await?;
        Ok(Some(outcome))
    }

    /// Shared end-state application: normalize, replace the scoped stem
    /// rows on success, and record bookkeeping either way.
    async fn apply(
        &self,
        track: &tracks::Track,
        version_id: Option<Uuid>,
        status: &StemTaskStatus,
        requested_mode: Option<&str>,
    ) -> Result<StemSyncOutcome, StemSyncError> {
        let assets: Vec<StemAsset> = extract_assets(&status.assets);
        let separation_mode = determine_separation_mode(requested_mode, assets.len()).to_string();

        let message = status
            .message
            .as_deref()
            .map(|m| sanitize_stem_text(m, 500))
            .filter(|m| !m.is_empty());

        let is_success = !assets.is_empty() && status.code.map_or(true, |c| c == 200);
        let is_failure = !is_success && status.is_failure();

        if is_success {
            let rows: Vec<track_stems::StemInsert> = assets
                .iter()
                .map(|asset| track_stems::StemInsert {
                    stem_type: asset.stem_type.clone(),
                    audio_url: asset.audio_url.clone(),
                    source_key: Some(asset.source_key.clone()),
                })
                .collect();

            track_stems::replace_stems(
                &self.db,
                track.id,
                version_id,
                &separation_mode,
                &status.task_id,
                &rows,
            )
            .await?;

            info!(
                track_id = %track.id,
                mode = separation_mode,
                assets = rows.len(),
                "Stem assets replaced"
            );
        }

        let next_status = if is_success {
            "completed"
        } else if is_failure {
            "failed"
        } else {
            track
                .metadata
                .get("stem_task_status")
                .and_then(|v| v.as_str())
                .unwrap_or("processing")
        }
        .to_string();

        let now = chrono::Utc::now().to_rfc3339();
        let bookkeeping = json!({
            "stem_task_id": status.task_id,
            "stem_version_id": version_id.map(|id| id.to_string()),
            "stem_separation_mode": separation_mode,
            "stem_task_status": next_status,
            "stem_task_completed_at": if is_success { Some(now.clone()) } else { None },
            "stem_last_error": if is_success { None } else { message.clone() },
            "stem_last_poll_code": status.code,
            "stem_last_poll_message": message.clone(),
            "stem_last_polled_at": now,
            "stem_assets_count": assets.len(),
        });
        let metadata = track.merged_metadata(&bookkeeping);

        if is_success {
            tracks::set_has_stems(&self.db, track.id, &metadata).await?;
        } else {
            tracks::update_metadata(&self.db, track.id, &metadata).await?;
        }

        Ok(StemSyncOutcome {
            track_id: track.id,
            version_id,
            task_id: status.task_id.clone(),
            separation_mode,
            assets: assets.len(),
            status: next_status,
            code: status.code,
            message,
        })
    }
}
