//! Bounded, newest-biased event buffer
//!
//! Producers push from any number of request contexts; the persister is the
//! single consumer. A push never waits on the backing store:
//!
//! ```text
//! push() ──> CircuitBreaker::allow()? ──no──> drop + count
//!                    │yes
//!                    └──> detached task ──> BufferStore::push ──> record success/failure
//! ```
//!
//! Each push is stamped with a sequence number in the producer's thread, so
//! the store orders and trims by push order even when the detached writes
//! land out of order.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBufferStore;
pub use sqlite::SqliteBufferStore;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::error::{CaptureError, PersistError, StoreError};
use crate::event::{BufferedItem, EventKind, RawEvent};
use async_trait::async_trait;
use serde::Serialize;
use crate::in_flight::{InFlight, InFlightGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Result of a store write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReceipt {
    /// Oldest items discarded to stay within capacity
    pub overflowed: usize,
    /// Items discarded because they outlived the store's retention window
    pub expired: usize,
}

/// Storage behind an [`EventBuffer`]
///
/// Implementations must make `push` (including its trim) and `pop_batch`
/// atomic with respect to each other: no payload is returned twice and none
/// disappears except through overflow or expiry.
#[async_trait]
pub trait BufferStore: Send + Sync + 'static {
    /// Insert a payload, then trim the queue to `max_size` by dropping the
    /// lowest sequence numbers
    async fn push(
        &self,
        queue: EventKind,
        seq: u64,
        payload: String,
        max_size: usize,
    ) -> Result<PushReceipt, StoreError>;

    /// Remove up to `max_count` payloads, oldest first
    async fn pop_batch(&self, queue: EventKind, max_count: usize) -> Result<Vec<String>, StoreError>;

    async fn len(&self, queue: EventKind) -> Result<usize, StoreError>;

    /// Remove everything from a queue, returning how many payloads were dropped
    async fn clear(&self, queue: EventKind) -> Result<usize, StoreError>;
}

/// Outcome of a producer-side push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Write handed to a detached task
    Dispatched,
    /// Circuit open; the item was dropped
    DroppedCircuitOpen,
}

/// Drop counters, readable for health checks
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DropStats {
    pub circuit_open: u64,
    pub overflow: u64,
    pub expired: u64,
    pub write_failed: u64,
}

#[derive(Debug, Default)]
struct DropCounters {
    circuit_open: AtomicU64,
    overflow: AtomicU64,
    expired: AtomicU64,
    write_failed: AtomicU64,
}

pub struct EventBuffer {
    store: Arc<dyn BufferStore>,
    breaker: Arc<CircuitBreaker>,
    max_size: usize,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    in_flight: Arc<InFlight>,
    drops: Arc<DropCounters>,
}

impl EventBuffer {
    pub fn new(
        store: Arc<dyn BufferStore>,
        breaker: Arc<CircuitBreaker>,
        max_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Seed from wall-clock microseconds so ordering survives restarts of a durable store
        let seed = clock.now().timestamp_micros().max(0) as u64;

        Self {
            store,
            breaker,
            max_size,
            clock,
            sequence: AtomicU64::new(seed),
            in_flight: Arc::new(InFlight::default()),
            drops: Arc::new(DropCounters::default()),
        }
    }

    /// Hand an event to the buffer without waiting for the store
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// write has been spawned (or vetoed by the circuit breaker).
    pub fn push(&self, event: RawEvent, fingerprint: Option<String>) -> Result<PushOutcome, CaptureError> {
        let kind = event.kind();

        if !self.breaker.allow() {
            self.drops.circuit_open.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_dropped(kind, "circuit_open", 1);
            return Ok(PushOutcome::DroppedCircuitOpen);
        }

        let handle = Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;

        let item = BufferedItem {
            event,
            fingerprint,
            enqueued_at: self.clock.now(),
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        let guard = InFlightGuard::enter(&self.in_flight);
        let store = self.store.clone();
        let breaker = self.breaker.clone();
        let drops = self.drops.clone();
        let max_size = self.max_size;

        handle.spawn(async move {
            let _guard = guard;

            let payload = match serde_json::to_string(&item) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, event_id = %item.event.id, "Failed to encode buffered item");
                    crate::metrics::record_dropped(kind, "malformed", 1);
                    return;
                }
            };

            match store.push(kind, seq, payload, max_size).await {
                Ok(receipt) => {
                    breaker.record_success();
                    if receipt.overflowed > 0 {
                        drops.overflow.fetch_add(receipt.overflowed as u64, Ordering::Relaxed);
                        crate::metrics::record_dropped(kind, "overflow", receipt.overflowed as u64);
                    }
                    if receipt.expired > 0 {
                        drops.expired.fetch_add(receipt.expired as u64, Ordering::Relaxed);
                        crate::metrics::record_dropped(kind, "expired", receipt.expired as u64);
                    }
                }
                Err(e) => {
                    breaker.record_failure();
                    drops.write_failed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_dropped(kind, "write_failed", 1);
                    tracing::debug!(error = %e, queue = %kind, "Buffer write failed, item dropped");
                }
            }
        });

        Ok(PushOutcome::Dispatched)
    }

    /// Remove up to `max_count` raw payloads from a queue, oldest first
    pub async fn pop_batch(&self, queue: EventKind, max_count: usize) -> Result<Vec<String>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        self.store.pop_batch(queue, max_count).await
    }

    pub async fn len(&self, queue: EventKind) -> Result<usize, StoreError> {
        self.store.len(queue).await
    }

    pub async fn clear(&self, queue: EventKind) -> Result<usize, StoreError> {
        self.store.clear(queue).await
    }

    /// Wait until every detached write spawned so far has finished
    pub async fn settle(&self) {
        self.in_flight.settle().await;
    }

    /// Detached writes that have not landed yet
    pub fn pending_writes(&self) -> usize {
        self.in_flight.count()
    }

    pub fn drop_stats(&self) -> DropStats {
        DropStats {
            circuit_open: self.drops.circuit_open.load(Ordering::Relaxed),
            overflow: self.drops.overflow.load(Ordering::Relaxed),
            expired: self.drops.expired.load(Ordering::Relaxed),
            write_failed: self.drops.write_failed.load(Ordering::Relaxed),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// Decode a payload popped from the buffer
pub fn decode_item(payload: &str) -> Result<BufferedItem, PersistError> {
    serde_json::from_str(payload).map_err(|e| PersistError::MalformedItem(e.to_string()))
}
