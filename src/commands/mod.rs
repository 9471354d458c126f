//! Command implementations for the CLI
//!
//! - run: capture pipeline with background persistence until a signal
//! - ingest: replay newline-delimited JSON events and flush
//! - errors: list, show, resolve and ignore aggregated errors
//! - slow: flagged performance traces
//! - maintenance: retention cleanup and database statistics
//! - config: configuration display and validation

pub mod config;
pub mod errors;
pub mod ingest;
pub mod maintenance;
pub mod run;
pub mod slow;
