//! SQLite-backed buffer store
//!
//! Survives process restarts and enforces a retention window: items older
//! than the window are purged on every push.

use super::{BufferStore, PushReceipt};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::event::EventKind;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

pub struct SqliteBufferStore {
    pool: SqlitePool,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteBufferStore {
    /// The pool must point at a database initialised by
    /// [`TelemetryDb::connect`](crate::storage::TelemetryDb::connect)
    pub fn new(pool: SqlitePool, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            retention,
            clock,
        }
    }
}

#[async_trait]
impl BufferStore for SqliteBufferStore {
    async fn push(
        &self,
        queue: EventKind,
        seq: u64,
        payload: String,
        max_size: usize,
    ) -> Result<PushReceipt, StoreError> {
        let now = self.clock.now().timestamp_millis();
        let cutoff = now - self.retention.as_millis() as i64;

        // First statement writes, so the transaction takes the write lock up front
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO buffered_items (queue, seq, payload, enqueued_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(queue.as_str())
        .bind(seq as i64)
        .bind(&payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let expired = sqlx::query("DELETE FROM buffered_items WHERE queue = ? AND enqueued_at < ?")
            .bind(queue.as_str())
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        let overflowed = sqlx::query(
            "DELETE FROM buffered_items WHERE id IN (
                 SELECT id FROM buffered_items
                 WHERE queue = ?
                 ORDER BY seq DESC, id DESC
                 LIMIT -1 OFFSET ?
             )",
        )
        .bind(queue.as_str())
        .bind(max_size.min(i64::MAX as usize) as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        tx.commit().await?;

        if expired > 0 {
            tracing::debug!(queue = %queue, expired, "Purged buffered items past retention");
        }

        Ok(PushReceipt { overflowed, expired })
    }

    async fn pop_batch(&self, queue: EventKind, max_count: usize) -> Result<Vec<String>, StoreError> {
        // Single statement: selection and removal happen under one write lock
        let mut rows: Vec<(i64, i64, String)> = sqlx::query_as(
            "DELETE FROM buffered_items WHERE id IN (
                 SELECT id FROM buffered_items
                 WHERE queue = ?
                 ORDER BY seq ASC, id ASC
                 LIMIT ?
             )
             RETURNING seq, id, payload",
        )
        .bind(queue.as_str())
        .bind(max_count.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        rows.sort_by_key(|(seq, id, _)| (*seq, *id));

        Ok(rows.into_iter().map(|(_, _, payload)| payload).collect())
    }

    async fn len(&self, queue: EventKind) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffered_items WHERE queue = ?")
            .bind(queue.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn clear(&self, queue: EventKind) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM buffered_items WHERE queue = ?")
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
