//! Provider balance endpoint
//!
//! Cached pass-through to the provider's account balance, so UI polling
//! does not burn provider rate limit. Shares the TTL-map abstraction
//! with the version cache.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

const BALANCE_CACHE_KEY: &str = "balance";

/// GET /balance
pub async fn balance_handler(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    if let Some(balance) = state.balance_cache.get(&BALANCE_CACHE_KEY.to_string()).await {
        return Ok(Json(json!({"balance": balance, "cached": true})));
    }

    let balance = state.provider_api.query_balance().await.map_err(|e| {
        warn!(error = %e, "Balance query failed");
        ApiError::Provider(e.to_string())
    })?;

    state
        .balance_cache
        .set(BALANCE_CACHE_KEY.to_string(), balance)
        .await;

    Ok(Json(json!({"balance": balance, "cached": false})))
}

/// Build balance routes
pub fn balance_routes() -> Router<AppState> {
    Router::new().route("/balance", get(balance_handler))
}
