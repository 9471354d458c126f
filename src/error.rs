//! Error taxonomy for the capture pipeline
//!
//! Everything downstream of a producer's capture call is isolated: the
//! capture entry points swallow [`CaptureError`] after logging it, the
//! persister logs [`PersistError`] per item and carries on. Only
//! [`ConfigError`] is allowed to surface, and only at startup.

use crate::alerts::ChannelKind;
use thiserror::Error;

/// Failure while ingesting an event on the producer side
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Event does not have the shape the pipeline accepts
    #[error("malformed event: {0}")]
    Malformed(String),

    /// Push was attempted outside of a tokio runtime
    #[error("no async runtime available to hand off the buffer write")]
    NoRuntime,

    /// Event could not be decoded from its JSON form
    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failure in a buffer or throttle backing store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure while persisting a single drained item
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Buffered payload could not be decoded; the item is discarded
    #[error("malformed buffered item: {0}")]
    MalformedItem(String),

    #[error("failed to encode record field: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("upsert for fingerprint {0} lost to concurrent writers")]
    Contention(String),
}

/// Invalid or unloadable configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failure delivering an alert through a channel
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("no transport registered for {0} channels")]
    NoTransport(ChannelKind),

    #[error("alert delivery failed: {0}")]
    Delivery(String),

    #[error("alert delivery timed out")]
    Timeout,
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
