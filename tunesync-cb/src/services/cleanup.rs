//! Cleanup daemon
//!
//! Periodic sweep bounding ledger and cache growth: evicts expired
//! version-cache entries, prunes old ledger rows, and fails `processing`
//! tracks whose generation job went silent. Runs for the life of the
//! process; each pass is cheap relative to the 5 minute cadence.

use crate::db::{tracks, webhook_deliveries};
use crate::services::callback_processor::VersionCache;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Terminal ledger rows are kept a week for audit.
pub const LEDGER_RETENTION_DAYS: i64 = 7;
/// Pending ledger rows older than this belong to a dead handler.
pub const STALE_PENDING_HOURS: i64 = 1;
/// `processing` tracks older than this never got their callback.
pub const STUCK_TRACK_HOURS: i64 = 3;

/// Periodic maintenance task.
pub struct CleanupDaemon {
    db: SqlitePool,
    version_cache: VersionCache,
}

impl CleanupDaemon {
    pub fn new(db: SqlitePool, version_cache: VersionCache) -> Self {
        Self { db, version_cache }
    }

    /// Spawn the sweep loop. Detached; never joined.
    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick; nothing to clean yet
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        });
    }

    /// One full pass. Failures are logged, never fatal; the next tick
    /// retries everything.
    pub async fn sweep_once(&self) {
        let evicted = self.version_cache.cleanup().await;

        let pruned = match webhook_deliveries::prune(
            &self.db,
            LEDGER_RETENTION_DAYS,
            STALE_PENDING_HOURS,
        )
        .await
        {
            Ok((terminal, stale)) => terminal + stale,
            Err(e) => {
                warn!(error = %e, "Ledger prune failed");
                0
            }
        };

        let stuck = match tracks::fail_stuck_processing(&self.db, STUCK_TRACK_HOURS).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Stuck track sweep failed");
                0
            }
        };

        if evicted > 0 || pruned > 0 || stuck > 0 {
            info!(
                cache_evicted = evicted,
                ledger_pruned = pruned,
                stuck_failed = stuck,
                "Cleanup sweep"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tracks::{find_by_id, insert_track, Track};
    use crate::services::callback_processor::VERSION_CACHE_TTL;
    use crate::types::TrackStatus;
    use serde_json::json;
    use tunesync_common::cache::TtlCache;

    #[tokio::test]
    async fn test_sweep_prunes_everything_due() {
        let pool = tunesync_common::db::init_memory_pool().await.unwrap();
        crate::db::schema::init_tables(&pool).await.unwrap();

        // Stuck processing track
        let track = Track::new("user-1", "musegen", "t1");
        insert_track(&pool, &track).await.unwrap();
        sqlx::query(
            "UPDATE tracks SET status = 'processing', updated_at = datetime('now', '-5 hours') WHERE id = ?",
        )
        .bind(track.id.to_string())
        .execute(&pool)
        .await
        .unwrap();

        // Old completed ledger row
        webhook_deliveries::register_delivery(&pool, "old", "musegen", "t1", None, &json!({}))
            .await
            .unwrap();
        webhook_deliveries::complete_delivery(&pool, "old", None).await.unwrap();
        sqlx::query(
            "UPDATE webhook_deliveries SET received_at = datetime('now', '-10 days') WHERE webhook_id = 'old'",
        )
        .execute(&pool)
        .await
        .unwrap();

        // Expired cache entry
        let cache: VersionCache = TtlCache::new(VERSION_CACHE_TTL);
        cache
            .set_with_ttl("t1".to_string(), Vec::new(), Duration::from_millis(1))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let daemon = CleanupDaemon::new(pool.clone(), cache.clone());
        daemon.sweep_once().await;

        assert!(cache.is_empty().await);
        let stuck = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, TrackStatus::Failed);
        assert_eq!(stuck.error_message.as_deref(), Some("generation timeout"));

        let ledger_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_deliveries")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(ledger_rows, 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_state_alone() {
        let pool = tunesync_common::db::init_memory_pool().await.unwrap();
        crate::db::schema::init_tables(&pool).await.unwrap();

        let track = Track::new("user-1", "musegen", "t1");
        insert_track(&pool, &track).await.unwrap();
        webhook_deliveries::register_delivery(&pool, "fresh", "musegen", "t1", None, &json!({}))
            .await
            .unwrap();

        let cache: VersionCache = TtlCache::new(VERSION_CACHE_TTL);
        cache.set("t1".to_string(), Vec::new()).await;

        let daemon = CleanupDaemon::new(pool.clone(), cache.clone());
        daemon.sweep_once().await;

        assert_eq!(cache.len().await, 1);
        let untouched = find_by_id(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TrackStatus::Pending);
        let ledger_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_deliveries")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(ledger_rows, 1);
    }
}
