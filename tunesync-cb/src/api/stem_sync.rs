//! Stem reconciliation endpoints
//!
//! Push and pull entry points over the shared reconciler:
//! `POST /stem-callback` receives the provider's separation webhook,
//! `POST /sync-stem-job` lets a client poll the provider directly when
//! no callback arrived in time. Both converge on the same
//! normalize → delete-old → insert-new end state.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::webhook_deliveries::{self, RegisterOutcome};
use crate::services::{StemSyncError, StemSyncOutcome, StemSyncRequest, StemTaskStatus};
use crate::AppState;

/// Request body for the pull-based resync.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StemSyncBody {
    pub track_id: Uuid,
    #[serde(default)]
    pub version_id: Option<Uuid>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub separation_mode: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

/// POST /sync-stem-job
pub async fn sync_stem_job_handler(
    State(state): State<AppState>,
    Json(body): Json<StemSyncBody>,
) -> Response {
    let request = StemSyncRequest {
        track_id: body.track_id,
        version_id: body.version_id,
        task_id: body.task_id,
        separation_mode: body.separation_mode,
        force_refresh: body.force_refresh,
    };

    match state.reconciler.sync_from_provider(&request).await {
        Ok(outcome) => {
            info!(
                track_id = %outcome.track_id,
                status = outcome.status,
                assets = outcome.assets,
                "Stem resync complete"
            );
            (StatusCode::OK, Json(outcome_body(&outcome))).into_response()
        }
        Err(e) => stem_sync_error_response(&state, e).await,
    }
}

/// POST /stem-callback
///
/// The provider pushes separation results here; the payload carries the
/// same task envelope as its status-query endpoint.
pub async fn stem_callback_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Stem callback with invalid JSON body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "error": "invalid_json"})),
            )
                .into_response();
        }
    };

    let status = stem_status_from_callback(&payload);
    let Some(status) = status else {
        warn!("Stem callback without task id");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "missing_task_id"})),
        )
            .into_response();
    };

    let webhook_id = headers
        .get("x-delivery-id")
        .or_else(|| headers.get("x-webhook-id"))
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            webhook_deliveries::synthesize_webhook_id(&state.provider, &status.task_id, "stem")
        });

    info!(webhook_id, task_id = status.task_id, "Stem callback received");

    match webhook_deliveries::register_delivery(
        &state.db,
        &webhook_id,
        &state.provider,
        &status.task_id,
        None,
        &payload,
    )
    .await
    {
        Ok(RegisterOutcome::New) | Ok(RegisterOutcome::RetryAfterFailure) => {}
        Ok(RegisterOutcome::AlreadyCompleted) | Ok(RegisterOutcome::InFlight) => {
            info!(webhook_id, "Duplicate stem callback ignored");
            return (
                StatusCode::OK,
                Json(json!({"ok": true, "idempotent": true})),
            )
                .into_response();
        }
        Err(e) => {
            error!(webhook_id, error = %e, "Failed to register stem delivery");
        }
    }

    match state.reconciler.apply_callback(&status, None).await {
        Ok(Some(outcome)) => {
            if let Err(e) =
                webhook_deliveries::complete_delivery(&state.db, &webhook_id, Some(outcome.track_id))
                    .await
            {
                warn!(webhook_id, error = %e, "Failed to complete delivery record");
            }
            (StatusCode::OK, Json(outcome_body(&outcome))).into_response()
        }
        Ok(None) => {
            if let Err(e) = webhook_deliveries::release_delivery(&state.db, &webhook_id).await {
                warn!(webhook_id, error = %e, "Failed to release delivery record");
            }
            (
                StatusCode::ACCEPTED,
                Json(json!({"ok": false, "retryable": true, "error": "track_not_found"})),
            )
                .into_response()
        }
        Err(e) => {
            let _ = webhook_deliveries::fail_delivery(&state.db, &webhook_id, &e.to_string()).await;
            stem_sync_error_response(&state, e).await
        }
    }
}

/// Fold the provider's stem callback payload into the same status shape
/// the pull path gets from the query endpoint.
fn stem_status_from_callback(payload: &Value) -> Option<StemTaskStatus> {
    let data = payload.get("data").cloned().unwrap_or(Value::Null);

    let task_id = data
        .get("taskId")
        .or_else(|| data.get("task_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();

    Some(StemTaskStatus {
        task_id,
        code: payload.get("code").and_then(Value::as_i64),
        status: data
            .get("successFlag")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: data
            .get("errorMessage")
            .and_then(Value::as_str)
            .or_else(|| payload.get("msg").and_then(Value::as_str))
            .map(str::to_string),
        assets: data.get("response").cloned().unwrap_or(Value::Null),
    })
}

fn outcome_body(outcome: &StemSyncOutcome) -> Value {
    json!({
        "success": true,
        "trackId": outcome.track_id,
        "versionId": outcome.version_id,
        "taskId": outcome.task_id,
        "separationMode": outcome.separation_mode,
        "assets": outcome.assets,
        "status": outcome.status,
        "code": outcome.code,
        "message": outcome.message,
    })
}

async fn stem_sync_error_response(state: &AppState, e: StemSyncError) -> Response {
    let (status, error_code) = match &e {
        StemSyncError::TrackNotFound(_) | StemSyncError::VersionNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        StemSyncError::VersionMismatch { .. } | StemSyncError::MissingTaskId(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        StemSyncError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
        StemSyncError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        state.record_error(&e.to_string()).await;
    }
    warn!(error = %e, "Stem sync failed");

    (
        status,
        Json(json!({"success": false, "error": error_code, "message": e.to_string()})),
    )
        .into_response()
}

/// Build stem routes
pub fn stem_routes() -> Router<AppState> {
    Router::new()
        .route("/sync-stem-job", post(sync_stem_job_handler))
        .route("/stem-callback", post(stem_callback_handler))
}
