//! Background retention cleanup
//!
//! Periodically deletes performance records past the retention window and
//! resolved or ignored errors that have not recurred within it.

use super::database::{CleanupStats, TelemetryDb};
use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

/// Cleanup configuration
#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Records older than this many days are eligible for deletion
    pub retention_days: u32,

    /// How often the task runs
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            interval: Duration::from_secs(3600),
        }
    }
}

impl CleanupConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            retention_days: config.retention_days,
            interval: config.cleanup_interval(),
        }
    }
}

/// Spawn background cleanup task
///
/// The first run happens one full interval after spawning. The task exits
/// when `shutdown` flips to true or its sender is dropped.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let handle = spawn_cleanup_task(db.clone(), CleanupConfig::default(), clock, shutdown_rx);
/// ```
pub fn spawn_cleanup_task(
    db: Arc<TelemetryDb>,
    config: CleanupConfig,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        cleanup_loop(db, config, clock, shutdown).await;
    })
}

async fn cleanup_loop(
    db: Arc<TelemetryDb>,
    config: CleanupConfig,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval_at(time::Instant::now() + config.interval, config.interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("Cleanup task stopping");
                    return;
                }
                continue;
            }
        }

        match db.cleanup_old_data(config.retention_days, clock.now()).await {
            Ok(stats) => {
                tracing::info!(
                    performance_deleted = stats.performance_deleted,
                    errors_deleted = stats.errors_deleted,
                    retention_days = config.retention_days,
                    "Scheduled cleanup completed"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Cleanup failed");
            }
        }
    }
}

/// Run cleanup immediately (for manual triggering)
pub async fn run_cleanup_now(
    db: &TelemetryDb,
    retention_days: u32,
    clock: &dyn Clock,
) -> Result<CleanupStats, sqlx::Error> {
    tracing::info!(retention_days, "Running manual cleanup");

    let stats = db.cleanup_old_data(retention_days, clock.now()).await?;

    tracing::info!(
        performance_deleted = stats.performance_deleted,
        errors_deleted = stats.errors_deleted,
        "Manual cleanup completed"
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn insert_error(db: &TelemetryDb, fingerprint: &str, status: &str, last_seen_at: i64) {
        sqlx::query(
            "INSERT INTO error_records (fingerprint, exception_type, status, first_seen_at, last_seen_at)
             VALUES (?, 'Timeout::Error', ?, ?, ?)",
        )
        .bind(fingerprint)
        .bind(status)
        .bind(last_seen_at)
        .bind(last_seen_at)
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_cleanup_now_keeps_unresolved_errors() {
        let db = TelemetryDb::connect("sqlite::memory:").await.unwrap();
        let clock = ManualClock::new();
        let old = (clock.now() - chrono::Duration::days(40)).timestamp_millis();
        let recent = clock.now().timestamp_millis();

        insert_error(&db, "old-unresolved", "unresolved", old).await;
        insert_error(&db, "old-resolved", "resolved", old).await;
        insert_error(&db, "old-ignored", "ignored", old).await;
        insert_error(&db, "recent-resolved", "resolved", recent).await;

        let stats = run_cleanup_now(&db, 30, &clock).await.unwrap();
        assert_eq!(stats.errors_deleted, 2);

        assert!(db.get_error("old-unresolved").await.unwrap().is_some());
        assert!(db.get_error("recent-resolved").await.unwrap().is_some());
        assert!(db.get_error("old-resolved").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_shutdown() {
        let db = Arc::new(TelemetryDb::connect("sqlite::memory:").await.unwrap());
        let (tx, rx) = watch::channel(false);

        let handle = spawn_cleanup_task(db, CleanupConfig::default(), Arc::new(ManualClock::new()), rx);
        tx.send(true).unwrap();

        time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_cleanup_config_default() {
        let config = CleanupConfig::default();
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.interval, Duration::from_secs(3600));
    }
}
