//! Query API for stored telemetry
//!
//! Filtered listings of error and performance records plus duration
//! percentiles per transaction.

use super::database::{ErrorRecord, ErrorStatus, PerformanceRecord, TelemetryDb, ERROR_COLUMNS, PERFORMANCE_COLUMNS};
use crate::event::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

const DEFAULT_LIMIT: usize = 100;

/// Filter for error queries
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub status: Option<ErrorStatus>,
    pub severity: Option<Severity>,

    /// Only errors last seen at or after this time
    pub since: Option<DateTime<Utc>>,

    /// Only errors last seen at or before this time
    pub until: Option<DateTime<Utc>>,

    /// Maximum number of results (default 100)
    pub limit: Option<usize>,
}

/// Filter for performance queries
#[derive(Debug, Clone, Default)]
pub struct PerformanceFilter {
    /// Exact transaction name
    pub transaction: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_duration_ms: Option<f64>,

    /// Only traces flagged with an N+1 pattern
    pub n_plus_one_only: bool,

    /// Only traces flagged with an N+1 pattern or a slow query
    pub flagged_only: bool,

    /// Maximum number of results (default 100)
    pub limit: Option<usize>,
}

/// Duration percentiles for a set of traces (nearest rank)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationPercentiles {
    pub count: usize,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl TelemetryDb {
    /// Query errors, most recently seen first
    ///
    /// # Example
    ///
    /// ```ignore
    /// let filter = ErrorFilter {
    ///     status: Some(ErrorStatus::Unresolved),
    ///     since: Some(Utc::now() - chrono::Duration::hours(24)),
    ///     ..Default::default()
    /// };
    /// let errors = db.query_errors(&filter).await?;
    /// ```
    pub async fn query_errors(&self, filter: &ErrorFilter) -> Result<Vec<ErrorRecord>, sqlx::Error> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM error_records WHERE 1=1", ERROR_COLUMNS));

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }

        if let Some(severity) = filter.severity {
            query.push(" AND severity = ").push_bind(severity.as_str());
        }

        if let Some(since) = filter.since {
            query.push(" AND last_seen_at >= ").push_bind(since.timestamp_millis());
        }

        if let Some(until) = filter.until {
            query.push(" AND last_seen_at <= ").push_bind(until.timestamp_millis());
        }

        query
            .push(" ORDER BY last_seen_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_LIMIT) as i64);

        query.build_query_as::<ErrorRecord>().fetch_all(self.pool()).await
    }

    /// Query performance records, newest first
    pub async fn query_performance(&self, filter: &PerformanceFilter) -> Result<Vec<PerformanceRecord>, sqlx::Error> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM performance_records WHERE 1=1",
            PERFORMANCE_COLUMNS
        ));

        if let Some(transaction) = &filter.transaction {
            query.push(" AND transaction_name = ").push_bind(transaction.clone());
        }

        if let Some(since) = filter.since {
            query.push(" AND captured_at >= ").push_bind(since.timestamp_millis());
        }

        if let Some(until) = filter.until {
            query.push(" AND captured_at <= ").push_bind(until.timestamp_millis());
        }

        if let Some(min) = filter.min_duration_ms {
            query.push(" AND duration_ms >= ").push_bind(min);
        }

        if filter.n_plus_one_only {
            query.push(" AND has_n_plus_one = 1");
        }

        if filter.flagged_only {
            query.push(" AND (has_n_plus_one = 1 OR has_slow_queries = 1)");
        }

        query
            .push(" ORDER BY captured_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_LIMIT) as i64);

        query.build_query_as::<PerformanceRecord>().fetch_all(self.pool()).await
    }

    /// p50/p95/p99 of trace durations, optionally for one transaction
    pub async fn performance_percentiles(
        &self,
        transaction: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<DurationPercentiles, sqlx::Error> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT duration_ms FROM performance_records WHERE 1=1");

        if let Some(transaction) = transaction {
            query.push(" AND transaction_name = ").push_bind(transaction.to_string());
        }

        if let Some(since) = since {
            query.push(" AND captured_at >= ").push_bind(since.timestamp_millis());
        }

        query.push(" ORDER BY duration_ms ASC");

        let durations: Vec<f64> = query.build_query_scalar::<f64>().fetch_all(self.pool()).await?;

        Ok(DurationPercentiles {
            count: durations.len(),
            p50: nearest_rank(&durations, 0.50),
            p95: nearest_rank(&durations, 0.95),
            p99: nearest_rank(&durations, 0.99),
        })
    }
}

/// Nearest-rank percentile over ascending values
fn nearest_rank(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}
