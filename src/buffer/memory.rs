//! In-process buffer store

use super::{BufferStore, PushReceipt};
use crate::error::StoreError;
use crate::event::EventKind;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Sequence-ordered queues held in memory, one mutex per queue
#[derive(Debug, Default)]
pub struct MemoryBufferStore {
    errors: Mutex<BTreeMap<u64, String>>,
    performance: Mutex<BTreeMap<u64, String>>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: EventKind) -> MutexGuard<'_, BTreeMap<u64, String>> {
        let queue = match kind {
            EventKind::Error => &self.errors,
            EventKind::Performance => &self.performance,
        };
        queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn push(
        &self,
        queue: EventKind,
        seq: u64,
        payload: String,
        max_size: usize,
    ) -> Result<PushReceipt, StoreError> {
        let mut items = self.queue(queue);
        items.insert(seq, payload);

        let mut overflowed = 0;
        while items.len() > max_size {
            items.pop_first();
            overflowed += 1;
        }

        Ok(PushReceipt {
            overflowed,
            expired: 0,
        })
    }

    async fn pop_batch(&self, queue: EventKind, max_count: usize) -> Result<Vec<String>, StoreError> {
        let mut items = self.queue(queue);
        let mut batch = Vec::with_capacity(max_count.min(items.len()));

        while batch.len() < max_count {
            match items.pop_first() {
                Some((_, payload)) => batch.push(payload),
                None => break,
            }
        }

        Ok(batch)
    }

    async fn len(&self, queue: EventKind) -> Result<usize, StoreError> {
        Ok(self.queue(queue).len())
    }

    async fn clear(&self, queue: EventKind) -> Result<usize, StoreError> {
        let mut items = self.queue(queue);
        let dropped = items.len();
        items.clear();
        Ok(dropped)
    }
}
