//! Telemetry service object
//!
//! [`Telemetry`] wires the filter, fingerprinting, circuit breaker, buffer,
//! persister and retention task together. Build it once at startup with
//! [`TelemetryBuilder`] and share it by `Arc`.
//!
//! The capture methods never fail from the caller's point of view: errors
//! and panics raised while ingesting are logged and counted here.

use crate::alerts::{AlertDispatcher, AlertOutbox, AlertTransport, ChannelKind, DEFAULT_MAX_PENDING_ALERTS};
use crate::buffer::{BufferStore, EventBuffer, MemoryBufferStore, PushOutcome, SqliteBufferStore};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::config::{BufferBackend, Config};
use crate::error::{CaptureError, Result};
use crate::event::{EventContext, EventKind, EventPayload, ErrorPayload, PerformancePayload, RawEvent};
use crate::filter::{FilterDecision, IngestFilter};
use crate::fingerprint::FingerprintGenerator;
use crate::metrics;
use crate::persister::{Persister, PersisterConfig};
use crate::storage::{spawn_cleanup_task, CleanupConfig, TelemetryDb};
use crate::throttle::{AlertThrottler, MemoryThrottleStore, ThrottleStore};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CLEANUP_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// What happened to a captured event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Handed to the buffer
    Buffered,
    /// Rejected by the ingest filter
    Filtered(FilterDecision),
    /// Dropped because the circuit is open
    DroppedCircuitOpen,
}

/// Health snapshot of the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub error_queue_len: usize,
    pub performance_queue_len: usize,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub dropped_circuit_open: u64,
    pub dropped_overflow: u64,
    pub dropped_expired: u64,
    pub write_failed: u64,
    pub filtered: u64,
    pub rejected: u64,
    /// Buffer writes handed off but not yet landed
    pub pending_writes: usize,
    /// Alert deliveries still running
    pub pending_alerts: usize,
    pub throttled_fingerprints: usize,
    pub persister_running: bool,
}

/// Totals for a synchronous flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub cycles: usize,
    pub drained: usize,
    pub persisted: usize,
    pub failed: usize,
    pub malformed: usize,
}

pub struct TelemetryBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    database: Option<Arc<TelemetryDb>>,
    buffer_store: Option<Arc<dyn BufferStore>>,
    throttle_store: Option<Arc<dyn ThrottleStore>>,
    transports: Vec<(ChannelKind, Arc<dyn AlertTransport>)>,
}

impl TelemetryBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            database: None,
            buffer_store: None,
            throttle_store: None,
            transports: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an already connected database instead of `database_url`
    pub fn database(mut self, db: Arc<TelemetryDb>) -> Self {
        self.database = Some(db);
        self
    }

    /// Override the buffer store selected by `buffer_backend`
    pub fn buffer_store(mut self, store: Arc<dyn BufferStore>) -> Self {
        self.buffer_store = Some(store);
        self
    }

    pub fn throttle_store(mut self, store: Arc<dyn ThrottleStore>) -> Self {
        self.throttle_store = Some(store);
        self
    }

    /// Register the transport for a channel kind
    pub fn transport(mut self, kind: ChannelKind, transport: Arc<dyn AlertTransport>) -> Self {
        self.transports.push((kind, transport));
        self
    }

    /// Validate the configuration and assemble the pipeline
    ///
    /// Invalid configuration is the one error that surfaces; nothing is
    /// started in that case.
    pub async fn build(self) -> Result<Telemetry> {
        self.config.validate()?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let filter = IngestFilter::from_config(&config)?;

        let db = match self.database {
            Some(db) => db,
            None => Arc::new(TelemetryDb::connect(&config.database_url).await?),
        };

        let store: Arc<dyn BufferStore> = match (self.buffer_store, config.buffer_backend) {
            (Some(store), _) => store,
            (None, BufferBackend::Memory) => Arc::new(MemoryBufferStore::new()),
            (None, BufferBackend::Sqlite) => Arc::new(SqliteBufferStore::new(
                db.pool().clone(),
                config.buffer_retention(),
                clock.clone(),
            )),
        };

        let breaker = Arc::new(CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                recovery_timeout: config.circuit_recovery(),
            },
            clock.clone(),
        ));

        let buffer = Arc::new(EventBuffer::new(store, breaker.clone(), config.buffer_max_size, clock.clone()));

        let throttle_store = self
            .throttle_store
            .unwrap_or_else(|| Arc::new(MemoryThrottleStore::new(clock.clone())));
        let throttler = Arc::new(AlertThrottler::new(
            throttle_store,
            config.alert_throttle_window(),
            clock.clone(),
        ));

        let dispatcher = self
            .transports
            .into_iter()
            .fold(AlertDispatcher::new(config.alert_channels.clone()), |dispatcher, (kind, transport)| {
                dispatcher.with_transport(kind, transport)
            });

        let persister = Persister::new(
            buffer.clone(),
            db.clone(),
            throttler,
            AlertOutbox::new(Arc::new(dispatcher), DEFAULT_MAX_PENDING_ALERTS),
            clock.clone(),
            PersisterConfig::from_config(&config),
        );

        metrics::describe_metrics();

        tracing::info!(
            buffer_backend = ?config.buffer_backend,
            buffer_max_size = config.buffer_max_size,
            sample_rate = config.sample_rate,
            performance_sample_rate = config.performance_sample_rate,
            alert_channels = config.alert_channels.len(),
            "Telemetry pipeline configured"
        );

        Ok(Telemetry {
            filter,
            fingerprints: FingerprintGenerator::new()
                .with_library_markers(config.library_frame_markers.iter().cloned()),
            buffer,
            breaker,
            db,
            persister,
            clock,
            filtered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cleanup: Mutex::new(None),
            config,
        })
    }
}

struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Telemetry {
    config: Config,
    filter: IngestFilter,
    fingerprints: FingerprintGenerator,
    buffer: Arc<EventBuffer>,
    breaker: Arc<CircuitBreaker>,
    db: Arc<TelemetryDb>,
    persister: Persister,
    clock: Arc<dyn Clock>,
    filtered: AtomicU64,
    rejected: AtomicU64,
    cleanup: Mutex<Option<CleanupHandle>>,
}

impl Telemetry {
    pub fn builder(config: Config) -> TelemetryBuilder {
        TelemetryBuilder::new(config)
    }

    /// Capture an event; never fails and never panics into the caller
    pub fn capture(&self, event: RawEvent) {
        let kind = event.kind();
        let id = event.id;

        match catch_unwind(AssertUnwindSafe(|| self.try_capture(event))) {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => self.reject(kind, id, &e),
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(queue = %kind, event_id = %id, "Capture panicked, event dropped");
            }
        }
    }

    pub fn capture_error(&self, error: ErrorPayload, context: EventContext) {
        self.capture(self.event_from(EventPayload::Error(error), context));
    }

    pub fn capture_performance(&self, performance: PerformancePayload, context: EventContext) {
        self.capture(self.event_from(EventPayload::Performance(performance), context));
    }

    fn event_from(&self, payload: EventPayload, context: EventContext) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            payload,
            context,
            captured_at: self.clock.now(),
            environment: None,
            release: None,
        }
    }

    /// Capture and report the outcome
    ///
    /// The producer-facing methods wrap this; it is public for tools such as
    /// the ingest command that want per-event results.
    pub fn try_capture(&self, event: RawEvent) -> Result<CaptureOutcome, CaptureError> {
        event.validate()?;

        let kind = event.kind();
        let decision = self.filter.decide(&event);
        if decision != FilterDecision::Capture {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            metrics::record_dropped(kind, "filtered", 1);
            return Ok(CaptureOutcome::Filtered(decision));
        }

        let fingerprint = match &event.payload {
            EventPayload::Error(error) => Some(self.fingerprints.generate(
                &error.exception_type,
                error.message.as_deref(),
                &error.frames,
            )),
            EventPayload::Performance(_) => None,
        };

        match self.buffer.push(event, fingerprint)? {
            PushOutcome::Dispatched => {
                metrics::record_captured(kind);
                Ok(CaptureOutcome::Buffered)
            }
            PushOutcome::DroppedCircuitOpen => Ok(CaptureOutcome::DroppedCircuitOpen),
        }
    }

    /// Decode a JSON event and capture it
    pub fn try_capture_json(&self, raw: &str) -> Result<CaptureOutcome, CaptureError> {
        self.try_capture(RawEvent::from_json(raw)?)
    }

    fn reject(&self, kind: EventKind, id: Uuid, error: &CaptureError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(queue = %kind, event_id = %id, error = %error, "Capture failed, event dropped");
    }

    /// Start the persister and the retention task
    ///
    /// Calling it again while running is a no-op.
    pub fn start(&self) {
        self.persister.start();

        let mut cleanup = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        if cleanup.as_ref().is_some_and(|c| !c.handle.is_finished()) {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = spawn_cleanup_task(
            self.db.clone(),
            CleanupConfig::from_config(&self.config),
            self.clock.clone(),
            rx,
        );
        *cleanup = Some(CleanupHandle { shutdown, handle });
    }

    /// Stop background work; bounded by the shutdown grace period
    ///
    /// Returns false if some work had to be abandoned.
    pub async fn stop(&self) -> bool {
        let cleanup = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(CleanupHandle { shutdown, mut handle }) = cleanup {
            let _ = shutdown.send(true);
            if tokio::time::timeout(CLEANUP_STOP_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.persister.stop().await
    }

    /// Drain both queues completely, one cycle after another
    pub async fn flush(&self) -> FlushReport {
        let mut total = FlushReport::default();

        loop {
            let report = self.persister.drain_now().await;
            total.cycles += 1;
            total.drained += report.drained();
            total.persisted += report.persisted();
            total.failed += report.errors.failed + report.performance.failed;
            total.malformed += report.errors.malformed + report.performance.malformed;

            let cap = self.config.persist_max_per_cycle;
            if report.errors.drained < cap && report.performance.drained < cap {
                break;
            }
        }

        total
    }

    /// Wait for alert deliveries started so far
    ///
    /// `flush` does not wait for them; each is bounded by the delivery timeout.
    pub async fn settle_alerts(&self) {
        self.persister.settle_alerts().await;
    }

    pub async fn stats(&self) -> PipelineStats {
        let drops = self.buffer.drop_stats();
        let circuit = self.breaker.snapshot();

        PipelineStats {
            error_queue_len: self.queue_len(EventKind::Error).await,
            performance_queue_len: self.queue_len(EventKind::Performance).await,
            circuit_state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            dropped_circuit_open: drops.circuit_open,
            dropped_overflow: drops.overflow,
            dropped_expired: drops.expired,
            write_failed: drops.write_failed,
            filtered: self.filtered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending_writes: self.buffer.pending_writes(),
            pending_alerts: self.persister.pending_alerts(),
            throttled_fingerprints: self.persister.throttled_fingerprints().await,
            persister_running: self.persister.is_running(),
        }
    }

    async fn queue_len(&self, kind: EventKind) -> usize {
        match self.buffer.len(kind).await {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(queue = %kind, error = %e, "Failed to read buffer length");
                0
            }
        }
    }

    pub fn db(&self) -> &Arc<TelemetryDb> {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}
