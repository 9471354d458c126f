//! Per-fingerprint alert throttling
//!
//! A fingerprint is throttled while its key exists in the store. The check
//! and the record are separate calls, so two callers racing on the same
//! fingerprint inside one window can both be admitted. Alert delivery is
//! best-effort and this double alert is tolerated.

use crate::clock::Clock;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key-value store with expiring entries
#[async_trait]
pub trait ThrottleStore: Send + Sync + 'static {
    /// True if `key` is present and not expired
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn set_with_expiry(&self, key: &str, value: DateTime<Utc>, ttl: Duration) -> Result<(), StoreError>;

    /// Drop expired entries and return how many went away
    ///
    /// Stores that expire keys on their own can keep the default.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Number of entries held, expired or not
    async fn tracked(&self) -> Result<usize, StoreError>;
}

/// In-process throttle store
///
/// Only the expiry of each key is kept; the alert timestamp matters to
/// shared stores that operators inspect. Expired entries are removed when
/// they are looked up and in bulk by `purge_expired`, which the persister
/// runs every cycle.
pub struct MemoryThrottleStore {
    entries: DashMap<String, Instant>,
    clock: Arc<dyn Clock>,
}

impl MemoryThrottleStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl ThrottleStore for MemoryThrottleStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.instant();
        let live = match self.entries.get(key) {
            Some(expires_at) => *expires_at > now,
            None => return Ok(false),
        };

        if !live {
            self.entries.remove_if(key, |_, expires_at| *expires_at <= now);
        }
        Ok(live)
    }

    async fn set_with_expiry(&self, key: &str, _value: DateTime<Utc>, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), self.clock.instant() + ttl);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.instant();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn tracked(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

pub struct AlertThrottler {
    store: Arc<dyn ThrottleStore>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl AlertThrottler {
    pub fn new(store: Arc<dyn ThrottleStore>, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { store, window, clock }
    }

    /// Whether an alert for `fingerprint` may go out now
    ///
    /// A failing store admits the alert.
    pub async fn should_alert(&self, fingerprint: &str) -> bool {
        match self.store.exists(fingerprint).await {
            Ok(throttled) => !throttled,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Throttle lookup failed, allowing alert");
                true
            }
        }
    }

    /// Start the throttle window for `fingerprint`
    pub async fn record(&self, fingerprint: &str) {
        if let Err(e) = self
            .store
            .set_with_expiry(fingerprint, self.clock.now(), self.window)
            .await
        {
            tracing::warn!(fingerprint = %fingerprint, error = %e, "Failed to record alert throttle");
        }
    }

    /// Remove fingerprints whose window has closed
    pub async fn purge_expired(&self) -> usize {
        match self.store.purge_expired().await {
            Ok(purged) => {
                if purged > 0 {
                    tracing::debug!(purged = purged, "Purged expired alert throttle entries");
                }
                purged
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge alert throttle entries");
                0
            }
        }
    }

    /// Fingerprints currently held by the store, zero if it cannot say
    pub async fn tracked(&self) -> usize {
        self.store.tracked().await.unwrap_or_default()
    }
}
