//! Durable storage for aggregated errors and performance traces
//!
//! SQLite through sqlx. [`TelemetryDb`] owns the pool; the query surface
//! and the retention task are implemented in the submodules.

pub mod cleanup;
pub mod database;
pub mod query;

pub use cleanup::{run_cleanup_now, spawn_cleanup_task, CleanupConfig};
pub use database::{CleanupStats, DatabaseStats, ErrorRecord, ErrorStatus, PerformanceRecord, TelemetryDb};
pub use query::{DurationPercentiles, ErrorFilter, PerformanceFilter};
