//! Idempotency ledger for webhook deliveries
//!
//! Every incoming webhook registers here before any side effect runs.
//! The provider delivers at-least-once, so the ledger is what turns
//! "at least once" into "side effects applied at most once": a delivery
//! that already completed is acknowledged without re-running mutation
//! logic, and a concurrent duplicate of an in-flight delivery is
//! likewise short-circuited.
//!
//! A delivery that ended in track-not-found is *released* (row deleted)
//! before answering 202, so the provider's retry is not swallowed by
//! the dedupe check. A delivery that ended in failure may be re-run on
//! retry; only one application ever completes.

use anyhow::Result;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Lifecycle of one ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Completed,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Completed => "completed",
            DeliveryStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "completed" => Some(DeliveryStatus::Completed),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// What `register_delivery` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Fresh row inserted; caller proceeds with side effects
    New,
    /// A prior attempt failed; row reset to pending, caller re-runs
    RetryAfterFailure,
    /// Same webhook id is being processed right now (concurrent duplicate)
    InFlight,
    /// Side effects already applied once; short-circuit idempotently
    AlreadyCompleted,
}

/// Fallback webhook id when the provider sends no delivery-id header.
///
/// Repeated deliveries of the same stage dedupe against each other,
/// while distinct stages of one task still apply independently.
pub fn synthesize_webhook_id(provider: &str, task_id: &str, stage: &str) -> String {
    format!("{provider}:{task_id}:{stage}")
}

/// Has this delivery already been applied successfully?
pub async fn check_processed(pool: &SqlitePool, webhook_id: &str) -> Result<bool> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM webhook_deliveries WHERE webhook_id = ?")
            .bind(webhook_id)
            .fetch_optional(pool)
            .await?;

    Ok(matches!(
        status.as_deref().and_then(DeliveryStatus::parse),
        Some(DeliveryStatus::Completed)
    ))
}

/// Record a delivery before running its side effects.
pub async fn register_delivery(
    pool: &SqlitePool,
    webhook_id: &str,
    provider: &str,
    task_id: &str,
    track_id: Option<Uuid>,
    payload: &Value,
) -> Result<RegisterOutcome> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO webhook_deliveries (webhook_id, provider, task_id, track_id, payload, status, received_at)
        VALUES (?, ?, ?, ?, ?, 'pending', CURRENT_TIMESTAMP)
        ON CONFLICT (webhook_id) DO NOTHING
        "#,
    )
    .bind(webhook_id)
    .bind(provider)
    .bind(task_id)
    .bind(track_id.map(|id| id.to_string()))
    .bind(payload.to_string())
    .execute(pool)
    .await?
    .rows_affected();

    if inserted > 0 {
        return Ok(RegisterOutcome::New);
    }

    let row = sqlx::query("SELECT status FROM webhook_deliveries WHERE webhook_id = ?")
        .bind(webhook_id)
        .fetch_optional(pool)
        .await?;

    let status = row
        .as_ref()
        .map(|r| r.get::<String, _>("status"))
        .and_then(|s| DeliveryStatus::parse(&s));

    match status {
        Some(DeliveryStatus::Completed) => Ok(RegisterOutcome::AlreadyCompleted),
        Some(DeliveryStatus::Pending) => Ok(RegisterOutcome::InFlight),
        Some(DeliveryStatus::Failed) => {
            // Allow the retry another attempt; exactly one application
            // will eventually complete
            sqlx::query(
                r#"
                UPDATE webhook_deliveries
                SET status = 'pending', error_message = NULL, received_at = CURRENT_TIMESTAMP
                WHERE webhook_id = ? AND status = 'failed'
                "#,
            )
            .bind(webhook_id)
            .execute(pool)
            .await?;
            Ok(RegisterOutcome::RetryAfterFailure)
        }
        // Row vanished between the insert and the read (released by a
        // concurrent handler); treat as in-flight and let the provider retry
        None => Ok(RegisterOutcome::InFlight),
    }
}

/// Best-effort audit write after successful processing.
pub async fn complete_delivery(
    pool: &SqlitePool,
    webhook_id: &str,
    track_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE webhook_deliveries
        SET status = 'completed',
            track_id = COALESCE(?, track_id),
            completed_at = CURRENT_TIMESTAMP
        WHERE webhook_id = ?
        "#,
    )
    .bind(track_id.map(|id| id.to_string()))
    .bind(webhook_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Best-effort audit write after a processing failure.
pub async fn fail_delivery(pool: &SqlitePool, webhook_id: &str, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE webhook_deliveries
        SET status = 'failed', error_message = ?
        WHERE webhook_id = ?
        "#,
    )
    .bind(message)
    .bind(webhook_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop a pending registration so the provider's retry is processed
/// afresh (track-not-found path).
pub async fn release_delivery(pool: &SqlitePool, webhook_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM webhook_deliveries WHERE webhook_id = ? AND status = 'pending'")
        .bind(webhook_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Bound ledger growth: drop terminal rows older than `terminal_days`
/// and pending rows abandoned longer than `stale_pending_hours` (a
/// handler that died mid-flight would otherwise dedupe retries forever).
pub async fn prune(
    pool: &SqlitePool,
    terminal_days: i64,
    stale_pending_hours: i64,
) -> Result<(u64, u64)> {
    let terminal = sqlx::query(
        r#"
        DELETE FROM webhook_deliveries
        WHERE status IN ('completed', 'failed')
          AND received_at < datetime('now', ?)
        "#,
    )
    .bind(format!("-{terminal_days} days"))
    .execute(pool)
    .await?
    .rows_affected();

    let stale = sqlx::query(
        r#"
        DELETE FROM webhook_deliveries
        WHERE status = 'pending'
          AND received_at < datetime('now', ?)
        "#,
    )
    .bind(format!("-{stale_pending_hours} hours"))
    .execute(pool)
    .await?
    .rows_affected();

    Ok((terminal, stale))
}
