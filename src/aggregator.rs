//! Error aggregation by fingerprint
//!
//! Every occurrence of an error is folded into the single record for its
//! fingerprint: the count goes up, `last_seen_at` moves forward, context is
//! deep-merged and a resolved issue is reopened.
//!
//! Two layers keep the one-record-per-fingerprint invariant:
//! - an in-process exclusive section per fingerprint
//! - the `UNIQUE(fingerprint)` constraint, with a bounded retry when an
//!   insert loses to a writer outside this process

use crate::clock::Clock;
use crate::error::PersistError;
use crate::event::{ErrorPayload, Severity, StackFrame};
use crate::storage::database::ERROR_COLUMNS;
use crate::storage::{ErrorRecord, ErrorStatus, TelemetryDb};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_ATTEMPTS: usize = 3;

/// Fields of one error occurrence
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFields {
    pub exception_type: String,
    pub message: Option<String>,
    pub backtrace: Vec<StackFrame>,
    pub context: Value,
    pub severity: Severity,
    pub handled: bool,
    pub environment: Option<String>,
    pub release: Option<String>,
}

impl ErrorFields {
    pub fn from_payload(
        payload: &ErrorPayload,
        context: Value,
        environment: Option<String>,
        release: Option<String>,
    ) -> Self {
        Self {
            exception_type: payload.exception_type.clone(),
            message: payload.message.clone(),
            backtrace: payload.frames.clone(),
            context,
            severity: payload.severity,
            handled: payload.handled,
            environment,
            release,
        }
    }
}

/// Result of an upsert
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub record: ErrorRecord,
    /// First occurrence of this fingerprint
    pub created: bool,
    /// Status before this occurrence; `None` when created
    pub previous_status: Option<ErrorStatus>,
}

impl UpsertOutcome {
    /// A resolved issue came back
    pub fn reopened(&self) -> bool {
        self.previous_status == Some(ErrorStatus::Resolved)
    }
}

pub struct Aggregator {
    db: Arc<TelemetryDb>,
    clock: Arc<dyn Clock>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Aggregator {
    pub fn new(db: Arc<TelemetryDb>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            locks: DashMap::new(),
        }
    }

    /// Fold one occurrence into the record for `fingerprint`
    pub async fn upsert(&self, fingerprint: &str, fields: ErrorFields) -> Result<UpsertOutcome, PersistError> {
        let lock = self.locks.entry(fingerprint.to_string()).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            self.upsert_with_retry(fingerprint, &fields).await
        };

        drop(lock);
        self.locks.remove_if(fingerprint, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn upsert_with_retry(&self, fingerprint: &str, fields: &ErrorFields) -> Result<UpsertOutcome, PersistError> {
        for attempt in 1..=MAX_ATTEMPTS {
            if let Some(outcome) = self.try_upsert(fingerprint, fields).await? {
                return Ok(outcome);
            }
            tracing::debug!(fingerprint = %fingerprint, attempt, "Upsert raced a concurrent insert, retrying");
        }

        Err(PersistError::Contention(fingerprint.to_string()))
    }

    /// One transactional attempt; `None` means a concurrent writer won the insert
    async fn try_upsert(&self, fingerprint: &str, fields: &ErrorFields) -> Result<Option<UpsertOutcome>, PersistError> {
        let now = self.clock.now().timestamp_millis();
        let mut tx = self.db.pool().begin().await?;

        // Writing first takes the database write lock for the rest of the transaction
        let existing = sqlx::query_as::<_, ErrorRecord>(&format!(
            "UPDATE error_records
             SET occurrence_count = occurrence_count + 1, last_seen_at = ?
             WHERE fingerprint = ?
             RETURNING {}",
            ERROR_COLUMNS
        ))
        .bind(now)
        .bind(fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(mut record) => {
                let previous_status = record.status;
                deep_merge(&mut record.context, fields.context.clone());
                if previous_status == ErrorStatus::Resolved {
                    record.status = ErrorStatus::Unresolved;
                }

                sqlx::query("UPDATE error_records SET context = ?, status = ? WHERE id = ?")
                    .bind(serde_json::to_string(&record.context)?)
                    .bind(record.status.as_str())
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await?;

                UpsertOutcome {
                    record,
                    created: false,
                    previous_status: Some(previous_status),
                }
            }
            None => {
                let inserted = sqlx::query_as::<_, ErrorRecord>(&format!(
                    "INSERT INTO error_records (
                        fingerprint, exception_type, message, backtrace, context, severity,
                        handled, occurrence_count, first_seen_at, last_seen_at, status,
                        environment, release
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, 'unresolved', ?, ?)
                     ON CONFLICT(fingerprint) DO NOTHING
                     RETURNING {}",
                    ERROR_COLUMNS
                ))
                .bind(fingerprint)
                .bind(&fields.exception_type)
                .bind(&fields.message)
                .bind(serde_json::to_string(&fields.backtrace)?)
                .bind(serde_json::to_string(&fields.context)?)
                .bind(fields.severity.as_str())
                .bind(fields.handled)
                .bind(now)
                .bind(now)
                .bind(&fields.environment)
                .bind(&fields.release)
                .fetch_optional(&mut *tx)
                .await?;

                match inserted {
                    Some(record) => UpsertOutcome {
                        record,
                        created: true,
                        previous_status: None,
                    },
                    None => {
                        tx.rollback().await?;
                        return Ok(None);
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(Some(outcome))
    }
}

/// Merge `incoming` into `base`; objects merge key by key, anything else is replaced
pub fn deep_merge(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Object(base), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, incoming) => *base = incoming,
    }
}
