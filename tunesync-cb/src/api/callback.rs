//! Generation callback endpoint
//!
//! Accepts the provider's multi-stage webhooks, dedupes them against
//! the delivery ledger, runs the state machine, and answers inside the
//! provider's timeout. Retryable conditions (track not yet committed)
//! are absorbed into a 202 so the provider is not taught to back off;
//! duplicates are absorbed into an idempotent 200.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::db::webhook_deliveries::{self, RegisterOutcome};
use crate::services::ProcessOutcome;
use crate::types::CallbackEnvelope;
use crate::AppState;

/// Preferred provider delivery-id header.
const HEADER_DELIVERY_ID: &str = "x-delivery-id";
/// Fallback delivery-id header some providers send instead.
const HEADER_WEBHOOK_ID: &str = "x-webhook-id";

/// POST /callback
pub async fn callback_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Malformed deliveries get a plain 400; the provider's retry of a
    // body it cannot serialize correctly will never succeed
    if !content_type_is_json(&headers) {
        warn!("Callback with invalid content-type");
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"ok": false, "error": "invalid_content_type"}),
        );
    }

    let payload_snapshot: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Callback with invalid JSON body");
            return reply(
                StatusCode::BAD_REQUEST,
                json!({"ok": false, "error": "invalid_json"}),
            );
        }
    };
    let envelope: CallbackEnvelope = match serde_json::from_value(payload_snapshot.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Callback body does not match the envelope shape");
            return reply(
                StatusCode::BAD_REQUEST,
                json!({"ok": false, "error": "invalid_payload"}),
            );
        }
    };

    let task_id = envelope.task_id().unwrap_or("unknown").to_string();
    let stage = envelope.callback_type();

    // Dedupe key: provider's delivery id when present, else synthesized
    // per (provider, task, stage) so distinct stages still apply
    let webhook_id = header_value(&headers, HEADER_DELIVERY_ID)
        .or_else(|| header_value(&headers, HEADER_WEBHOOK_ID))
        .unwrap_or_else(|| {
            webhook_deliveries::synthesize_webhook_id(&state.provider, &task_id, stage.as_str())
        });

    info!(webhook_id, task_id, stage = %stage, "Callback received");

    match webhook_deliveries::check_processed(&state.db, &webhook_id).await {
        Ok(true) => {
            info!(webhook_id, "Duplicate webhook ignored");
            return reply(StatusCode::OK, json!({"ok": true, "idempotent": true}));
        }
        Ok(false) => {}
        Err(e) => {
            // Degraded ledger must not drop the callback; processing
            // stays convergent even if a duplicate slips through
            error!(webhook_id, error = %e, "Idempotency check failed");
        }
    }

    match webhook_deliveries::register_delivery(
        &state.db,
        &webhook_id,
        &state.provider,
        &task_id,
        None,
        &payload_snapshot,
    )
    .await
    {
        Ok(RegisterOutcome::New) | Ok(RegisterOutcome::RetryAfterFailure) => {}
        Ok(RegisterOutcome::AlreadyCompleted) | Ok(RegisterOutcome::InFlight) => {
            info!(webhook_id, "Duplicate webhook ignored");
            return reply(StatusCode::OK, json!({"ok": true, "idempotent": true}));
        }
        Err(e) => {
            error!(webhook_id, error = %e, "Failed to register webhook delivery");
        }
    }

    match state.processor.process(&envelope).await {
        Ok(ProcessOutcome::Applied {
            track_id,
            stage,
            cached,
        }) => {
            if let Err(e) =
                webhook_deliveries::complete_delivery(&state.db, &webhook_id, Some(track_id)).await
            {
                warn!(webhook_id, error = %e, "Failed to complete delivery record");
            }
            info!(
                webhook_id,
                track_id = %track_id,
                stage = %stage,
                cached,
                "Callback processing complete"
            );
            reply(
                StatusCode::OK,
                json!({
                    "ok": true,
                    "trackId": track_id,
                    "stage": stage.as_str(),
                    "cached": cached,
                }),
            )
        }
        Ok(ProcessOutcome::TrackNotFound) => {
            // Release the registration so the provider's retry is
            // processed afresh instead of being swallowed by dedupe
            if let Err(e) = webhook_deliveries::release_delivery(&state.db, &webhook_id).await {
                warn!(webhook_id, error = %e, "Failed to release delivery record");
            }
            warn!(webhook_id, task_id, "Track not found; acknowledging for retry");
            reply(
                StatusCode::ACCEPTED,
                json!({"ok": false, "retryable": true, "error": "track_not_found"}),
            )
        }
        Ok(ProcessOutcome::MissingTaskId) => {
            let _ = webhook_deliveries::fail_delivery(&state.db, &webhook_id, "missing_task_id")
                .await;
            reply(
                StatusCode::BAD_REQUEST,
                json!({"ok": false, "error": "missing_task_id"}),
            )
        }
        Err(e) => {
            let _ = webhook_deliveries::fail_delivery(&state.db, &webhook_id, &e.to_string()).await;
            state.record_error(&e.to_string()).await;
            error!(webhook_id, task_id, error = %e, "Callback processing failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"ok": false, "error": "internal_error"}),
            )
        }
    }
}

fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Build callback routes
pub fn callback_routes() -> Router<AppState> {
    Router::new().route("/callback", post(callback_handler))
}
