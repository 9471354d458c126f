//! SQLite database layer for durable telemetry records
//!
//! This module provides:
//! - Connection pooling with WAL mode for concurrent reads/writes
//! - Schema creation on connect
//! - Record types for errors and performance traces
//! - Retention cleanup

use crate::clock::from_millis;
use crate::event::{Severity, StackFrame, TransactionType};
use crate::query_patterns::{NPlusOnePattern, SlowQuery};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS error_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        exception_type TEXT NOT NULL,
        message TEXT,
        backtrace TEXT NOT NULL DEFAULT '[]',
        context TEXT NOT NULL DEFAULT '{}',
        severity TEXT NOT NULL DEFAULT 'error',
        handled INTEGER NOT NULL DEFAULT 0,
        occurrence_count INTEGER NOT NULL DEFAULT 1 CHECK (occurrence_count >= 1),
        first_seen_at INTEGER NOT NULL,
        last_seen_at INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'unresolved',
        environment TEXT,
        release TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_error_records_status ON error_records (status, last_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_error_records_severity ON error_records (severity)",
    "CREATE TABLE IF NOT EXISTS performance_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT NOT NULL UNIQUE,
        transaction_name TEXT NOT NULL,
        transaction_type TEXT NOT NULL,
        duration_ms REAL NOT NULL,
        db_duration_ms REAL NOT NULL,
        view_duration_ms REAL,
        query_count INTEGER NOT NULL,
        n_plus_one_patterns TEXT NOT NULL DEFAULT '[]',
        slow_queries TEXT NOT NULL DEFAULT '[]',
        has_n_plus_one INTEGER NOT NULL DEFAULT 0,
        has_slow_queries INTEGER NOT NULL DEFAULT 0,
        context TEXT NOT NULL DEFAULT '{}',
        environment TEXT,
        release TEXT,
        captured_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_performance_records_txn ON performance_records (transaction_name, captured_at)",
    "CREATE INDEX IF NOT EXISTS idx_performance_records_captured ON performance_records (captured_at)",
    "CREATE TABLE IF NOT EXISTS buffered_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        seq INTEGER NOT NULL,
        payload TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_buffered_items_queue ON buffered_items (queue, seq)",
];

pub(crate) const ERROR_COLUMNS: &str = "id, fingerprint, exception_type, message, backtrace, context, severity, handled, \
     occurrence_count, first_seen_at, last_seen_at, status, environment, release";

pub(crate) const PERFORMANCE_COLUMNS: &str = "id, event_id, transaction_name, transaction_type, duration_ms, db_duration_ms, \
     view_duration_ms, query_count, n_plus_one_patterns, slow_queries, has_n_plus_one, has_slow_queries, \
     context, environment, release, captured_at";

/// Lifecycle of a grouped error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Unresolved,
    Resolved,
    Ignored,
}

impl ErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unresolved" => Some(Self::Unresolved),
            "resolved" => Some(Self::Resolved),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub fingerprint: String,
    pub exception_type: String,
    pub message: Option<String>,
    pub backtrace: Vec<StackFrame>,
    pub context: Value,
    pub severity: Severity,
    pub handled: bool,
    pub occurrence_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: ErrorStatus,
    pub environment: Option<String>,
    pub release: Option<String>,
}

impl sqlx::FromRow<'_, SqliteRow> for ErrorRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let backtrace: String = row.try_get("backtrace")?;
        let context: String = row.try_get("context")?;
        let severity: String = row.try_get("severity")?;
        let status: String = row.try_get("status")?;

        Ok(Self {
            id: row.try_get("id")?,
            fingerprint: row.try_get("fingerprint")?,
            exception_type: row.try_get("exception_type")?,
            message: row.try_get("message")?,
            backtrace: serde_json::from_str(&backtrace).map_err(decode_error("backtrace"))?,
            context: serde_json::from_str(&context).map_err(decode_error("context"))?,
            severity: Severity::parse(&severity).unwrap_or_default(),
            handled: row.try_get("handled")?,
            occurrence_count: row.try_get("occurrence_count")?,
            first_seen_at: from_millis(row.try_get("first_seen_at")?),
            last_seen_at: from_millis(row.try_get("last_seen_at")?),
            status: ErrorStatus::parse(&status).unwrap_or(ErrorStatus::Unresolved),
            environment: row.try_get("environment")?,
            release: row.try_get("release")?,
        })
    }
}

/// One row per trace; never deduplicated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub id: Option<i64>,
    pub event_id: String,
    pub transaction_name: String,
    pub transaction_type: TransactionType,
    pub duration_ms: f64,
    pub db_duration_ms: f64,
    pub view_duration_ms: Option<f64>,
    pub query_count: i64,
    pub n_plus_one_patterns: Vec<NPlusOnePattern>,
    pub slow_queries: Vec<SlowQuery>,
    pub has_n_plus_one: bool,
    pub has_slow_queries: bool,
    pub context: Value,
    pub environment: Option<String>,
    pub release: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, SqliteRow> for PerformanceRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let transaction_type: String = row.try_get("transaction_type")?;
        let patterns: String = row.try_get("n_plus_one_patterns")?;
        let slow: String = row.try_get("slow_queries")?;
        let context: String = row.try_get("context")?;

        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            transaction_name: row.try_get("transaction_name")?,
            transaction_type: match transaction_type.as_str() {
                "job" => TransactionType::Job,
                "custom" => TransactionType::Custom,
                _ => TransactionType::Request,
            },
            duration_ms: row.try_get("duration_ms")?,
            db_duration_ms: row.try_get("db_duration_ms")?,
            view_duration_ms: row.try_get("view_duration_ms")?,
            query_count: row.try_get("query_count")?,
            n_plus_one_patterns: serde_json::from_str(&patterns).map_err(decode_error("n_plus_one_patterns"))?,
            slow_queries: serde_json::from_str(&slow).map_err(decode_error("slow_queries"))?,
            has_n_plus_one: row.try_get("has_n_plus_one")?,
            has_slow_queries: row.try_get("has_slow_queries")?,
            context: serde_json::from_str(&context).map_err(decode_error("context"))?,
            environment: row.try_get("environment")?,
            release: row.try_get("release")?,
            captured_at: from_millis(row.try_get("captured_at")?),
        })
    }
}

fn decode_error(column: &'static str) -> impl Fn(serde_json::Error) -> sqlx::Error {
    move |e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    }
}

/// Durable telemetry database handle
///
/// Manages the SQLite connection pool. Shared by the persister, the
/// aggregator, the SQLite buffer store and the query surface.
pub struct TelemetryDb {
    pool: SqlitePool,
}

/// An in-memory database exists only inside its one connection, so that
/// connection is never closed for idleness or age.
fn pool_options(database_url: &str) -> SqlitePoolOptions {
    let options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));

    if database_url.contains(":memory:") {
        options.max_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        options.max_connections(5)
    }
}

impl TelemetryDb {
    /// Connect and create the schema if needed
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = TelemetryDb::connect("sqlite:./data/faultline.db").await?;
    /// ```
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", "-16000")
            .pragma("temp_store", "memory")
            .pragma("synchronous", "NORMAL");

        let pool = pool_options(database_url).connect_with(options).await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }

        tracing::debug!("Telemetry database schema ready");
        Ok(())
    }

    /// Insert a performance record
    ///
    /// Re-inserting the same event id is a no-op, so a retried item cannot
    /// produce a duplicate row. Returns whether a row was written.
    pub async fn insert_performance(&self, record: &PerformanceRecord) -> Result<bool, crate::error::PersistError> {
        let patterns = serde_json::to_string(&record.n_plus_one_patterns)?;
        let slow = serde_json::to_string(&record.slow_queries)?;
        let context = serde_json::to_string(&record.context)?;

        let result = sqlx::query(
            "INSERT INTO performance_records (
                event_id, transaction_name, transaction_type, duration_ms, db_duration_ms,
                view_duration_ms, query_count, n_plus_one_patterns, slow_queries,
                has_n_plus_one, has_slow_queries, context, environment, release, captured_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(&record.event_id)
        .bind(&record.transaction_name)
        .bind(record.transaction_type.as_str())
        .bind(record.duration_ms)
        .bind(record.db_duration_ms)
        .bind(record.view_duration_ms)
        .bind(record.query_count)
        .bind(&patterns)
        .bind(&slow)
        .bind(record.has_n_plus_one)
        .bind(record.has_slow_queries)
        .bind(&context)
        .bind(&record.environment)
        .bind(&record.release)
        .bind(record.captured_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch the record for a fingerprint
    pub async fn get_error(&self, fingerprint: &str) -> Result<Option<ErrorRecord>, sqlx::Error> {
        sqlx::query_as::<_, ErrorRecord>(&format!(
            "SELECT {} FROM error_records WHERE fingerprint = ?",
            ERROR_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
    }

    /// Change an error's status (resolve, ignore, reopen)
    ///
    /// Returns false if the fingerprint is unknown.
    pub async fn set_status(&self, fingerprint: &str, status: ErrorStatus) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE error_records SET status = ? WHERE fingerprint = ?")
            .bind(status.as_str())
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Row counts for health checks and the CLI
    pub async fn get_stats(&self) -> Result<DatabaseStats, sqlx::Error> {
        let error_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM error_records")
            .fetch_one(&self.pool)
            .await?;

        let unresolved_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM error_records WHERE status = 'unresolved'")
                .fetch_one(&self.pool)
                .await?;

        let occurrence_total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(occurrence_count), 0) FROM error_records")
                .fetch_one(&self.pool)
                .await?;

        let performance_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM performance_records")
            .fetch_one(&self.pool)
            .await?;

        let buffered_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffered_items")
            .fetch_one(&self.pool)
            .await?;

        Ok(DatabaseStats {
            error_count: error_count as u64,
            unresolved_count: unresolved_count as u64,
            occurrence_total: occurrence_total as u64,
            performance_count: performance_count as u64,
            buffered_count: buffered_count as u64,
        })
    }

    /// Delete data older than the retention window
    ///
    /// Performance records go once they are older than `retention_days`.
    /// Error records go only when they are resolved or ignored and have not
    /// recurred within the window; unresolved issues are kept regardless of age.
    pub async fn cleanup_old_data(&self, retention_days: u32, now: DateTime<Utc>) -> Result<CleanupStats, sqlx::Error> {
        let cutoff = now.timestamp_millis() - i64::from(retention_days) * 24 * 60 * 60 * 1000;

        let mut tx = self.pool.begin().await?;

        let performance_deleted = sqlx::query("DELETE FROM performance_records WHERE captured_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let errors_deleted = sqlx::query(
            "DELETE FROM error_records
             WHERE last_seen_at < ? AND status IN ('resolved', 'ignored')",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if performance_deleted + errors_deleted > 0 {
            // Reclaim disk space (not in transaction)
            if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
                tracing::warn!(error = %e, "VACUUM after cleanup failed");
            }
        }

        Ok(CleanupStats {
            performance_deleted,
            errors_deleted,
        })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub error_count: u64,
    pub unresolved_count: u64,
    pub occurrence_total: u64,
    pub performance_count: u64,
    pub buffered_count: u64,
}

/// Cleanup statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupStats {
    pub performance_deleted: u64,
    pub errors_deleted: u64,
}
