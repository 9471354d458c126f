//! Background persister
//!
//! One loop per [`Persister`] drains the buffer on a fixed interval:
//! errors first, then performance traces, in batches up to a per-cycle cap.
//! Every drained item is scrubbed and stored on its own; a failing or
//! malformed item is logged and the batch moves on.
//!
//! ```text
//! tick ──> pop_batch(errors) ──> scrub ──> Aggregator::upsert ──> throttle ──> AlertOutbox
//!      └─> pop_batch(perf)   ──> scrub ──> N+1 detection ──> insert
//! ```
//!
//! Shutdown is checked between batches, so a batch that has been popped is
//! always persisted before the loop exits. Alerts are delivered on detached
//! tasks and never hold up a cycle or a shutdown.

use crate::aggregator::{Aggregator, ErrorFields, UpsertOutcome};
use crate::alerts::{AlertOutbox, AlertSignal};
use crate::buffer::{decode_item, EventBuffer};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::PersistError;
use crate::event::{BufferedItem, EventKind, EventPayload, PerformancePayload};
use crate::fingerprint::FingerprintGenerator;
use crate::metrics;
use crate::query_patterns::{slow_queries, QueryPatternDetector};
use crate::scrub::Scrubber;
use crate::storage::{ErrorStatus, PerformanceRecord, TelemetryDb};
use crate::throttle::AlertThrottler;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

#[derive(Debug, Clone)]
pub struct PersisterConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub max_per_cycle: usize,
    pub shutdown_grace: Duration,
    pub slow_query_threshold_ms: f64,
    pub max_n_plus_one_patterns: usize,
    pub scrub_fields: Vec<String>,
    pub library_frame_markers: Vec<String>,
}

impl PersisterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.persist_interval(),
            batch_size: config.persist_batch_size,
            max_per_cycle: config.persist_max_per_cycle,
            shutdown_grace: config.shutdown_grace(),
            slow_query_threshold_ms: config.slow_query_threshold_ms,
            max_n_plus_one_patterns: config.max_n_plus_one_patterns,
            scrub_fields: config.scrub_fields.clone(),
            library_frame_markers: config.library_frame_markers.clone(),
        }
    }
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Counts for one queue within one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub batches: usize,
    pub drained: usize,
    pub persisted: usize,
    pub failed: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleReport {
    pub errors: QueueReport,
    pub performance: QueueReport,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn drained(&self) -> usize {
        self.errors.drained + self.performance.drained
    }

    pub fn persisted(&self) -> usize {
        self.errors.persisted + self.performance.persisted
    }
}

/// Everything one cycle needs; shared between the loop and on-demand drains
struct Worker {
    buffer: Arc<EventBuffer>,
    db: Arc<TelemetryDb>,
    aggregator: Aggregator,
    fingerprints: FingerprintGenerator,
    detector: QueryPatternDetector,
    scrubber: Scrubber,
    throttler: Arc<AlertThrottler>,
    alerts: AlertOutbox,
    config: PersisterConfig,
    // Serializes cycles: the buffer has a single consumer
    cycle: tokio::sync::Mutex<()>,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Persister {
    worker: Arc<Worker>,
    running: Mutex<Option<RunningLoop>>,
}

impl Persister {
    pub fn new(
        buffer: Arc<EventBuffer>,
        db: Arc<TelemetryDb>,
        throttler: Arc<AlertThrottler>,
        alerts: AlertOutbox,
        clock: Arc<dyn Clock>,
        config: PersisterConfig,
    ) -> Self {
        let worker = Worker {
            aggregator: Aggregator::new(db.clone(), clock),
            fingerprints: FingerprintGenerator::new()
                .with_library_markers(config.library_frame_markers.iter().cloned()),
            detector: QueryPatternDetector::new(config.max_n_plus_one_patterns),
            scrubber: Scrubber::new(&config.scrub_fields),
            buffer,
            db,
            throttler,
            alerts,
            config,
            cycle: tokio::sync::Mutex::new(()),
        };

        Self {
            worker: Arc::new(worker),
            running: Mutex::new(None),
        }
    }

    /// Start the background loop
    ///
    /// Returns false if a loop is already running. Must be called within a
    /// tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                tracing::debug!("Persister already running");
                return false;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = self.worker.clone();

        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(persist_loop(worker, shutdown_rx))
                .catch_unwind()
                .await;
            if let Err(e) = result {
                tracing::error!(panic = ?e, "Persister loop panicked");
            }
        });

        *running = Some(RunningLoop {
            shutdown: shutdown_tx,
            handle,
        });

        tracing::info!(
            interval_secs = self.worker.config.interval.as_secs(),
            batch_size = self.worker.config.batch_size,
            max_per_cycle = self.worker.config.max_per_cycle,
            "Persister started"
        );
        true
    }

    /// Stop the loop, then drain what is left, all within the shutdown grace
    ///
    /// Returns false if the grace period ran out and work was abandoned.
    pub async fn stop(&self) -> bool {
        let deadline = time::Instant::now() + self.worker.config.shutdown_grace;

        let current = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(RunningLoop { shutdown, mut handle }) = current {
            let _ = shutdown.send(true);

            if time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!("Persister loop did not exit within the shutdown grace period, aborted");
                return false;
            }
        }

        match time::timeout_at(deadline, self.drain_now()).await {
            Ok(report) => {
                tracing::info!(
                    drained = report.drained(),
                    persisted = report.persisted(),
                    alerts_pending = self.worker.alerts.pending(),
                    "Persister stopped"
                );
                true
            }
            Err(_) => {
                tracing::warn!("Final drain did not finish within the shutdown grace period");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one cycle now, after pending buffer writes have landed
    pub async fn drain_now(&self) -> CycleReport {
        self.worker.buffer.settle().await;
        self.worker.run_cycle(None).await
    }

    /// Alert deliveries still running
    pub fn pending_alerts(&self) -> usize {
        self.worker.alerts.pending()
    }

    /// Wait for every alert delivery started so far
    pub async fn settle_alerts(&self) {
        self.worker.alerts.settle().await;
    }

    /// Fingerprints inside an open throttle window
    pub async fn throttled_fingerprints(&self) -> usize {
        self.worker.throttler.tracked().await
    }
}

async fn persist_loop(worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let interval = worker.config.interval;
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let report = worker.run_cycle(Some(&shutdown)).await;
        if report.drained() > 0 {
            tracing::debug!(
                errors = report.errors.drained,
                performance = report.performance.drained,
                failed = report.errors.failed + report.performance.failed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Persist cycle completed"
            );
        }

        if *shutdown.borrow() {
            break;
        }
    }

    tracing::debug!("Persister loop exiting");
}

impl Worker {
    async fn run_cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> CycleReport {
        let _cycle = self.cycle.lock().await;
        let start = Instant::now();

        let errors = self.drain_queue(EventKind::Error, shutdown).await;
        let performance = self.drain_queue(EventKind::Performance, shutdown).await;
        self.throttler.purge_expired().await;

        let elapsed = start.elapsed();
        metrics::record_cycle_duration(elapsed);

        CycleReport {
            errors,
            performance,
            elapsed,
        }
    }

    async fn drain_queue(&self, kind: EventKind, shutdown: Option<&watch::Receiver<bool>>) -> QueueReport {
        let mut report = QueueReport::default();

        while report.drained < self.config.max_per_cycle {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                break;
            }

            let want = self.config.batch_size.min(self.config.max_per_cycle - report.drained);
            let batch = match self.buffer.pop_batch(kind, want).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(queue = %kind, error = %e, "Failed to pop batch from buffer");
                    break;
                }
            };

            if batch.is_empty() {
                break;
            }

            report.batches += 1;
            report.drained += batch.len();

            for payload in &batch {
                let result = AssertUnwindSafe(self.persist_payload(kind, payload))
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {
                        report.persisted += 1;
                        metrics::record_persisted(kind);
                    }
                    Ok(Err(PersistError::MalformedItem(reason))) => {
                        report.malformed += 1;
                        metrics::record_dropped(kind, "malformed", 1);
                        tracing::warn!(queue = %kind, reason = %reason, "Discarding malformed buffered item");
                    }
                    Ok(Err(e)) => {
                        report.failed += 1;
                        metrics::record_persist_failure(kind);
                        tracing::error!(queue = %kind, error = %e, "Failed to persist buffered item");
                    }
                    Err(panic) => {
                        report.failed += 1;
                        metrics::record_persist_failure(kind);
                        tracing::error!(queue = %kind, panic = ?panic, "Persisting buffered item panicked");
                    }
                }
            }
        }

        report
    }

    async fn persist_payload(&self, kind: EventKind, payload: &str) -> Result<(), PersistError> {
        let item = decode_item(payload)?;

        if item.event.kind() != kind {
            return Err(PersistError::MalformedItem(format!(
                "{} event found in {} queue",
                item.event.kind(),
                kind
            )));
        }

        match &item.event.payload {
            EventPayload::Error(_) => self.persist_error(&item).await,
            EventPayload::Performance(perf) => self.persist_performance(&item, perf).await,
        }
    }

    async fn persist_error(&self, item: &BufferedItem) -> Result<(), PersistError> {
        let EventPayload::Error(error) = &item.event.payload else {
            return Err(PersistError::MalformedItem("expected an error event".to_string()));
        };

        let fingerprint = match &item.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => self.fingerprints.generate(
                &error.exception_type,
                error.message.as_deref(),
                &error.frames,
            ),
        };

        let context = self.scrubber.scrubbed(item.event.context.to_value());
        let fields = ErrorFields::from_payload(
            error,
            context,
            item.event.environment.clone(),
            item.event.release.clone(),
        );

        let outcome = self.aggregator.upsert(&fingerprint, fields).await?;
        self.maybe_alert(&outcome).await;
        Ok(())
    }

    async fn persist_performance(&self, item: &BufferedItem, perf: &PerformancePayload) -> Result<(), PersistError> {
        let patterns = self.detector.detect(&perf.queries);
        let slow = slow_queries(&perf.queries, self.config.slow_query_threshold_ms);
        let db_duration_ms = perf
            .db_duration_ms
            .unwrap_or_else(|| perf.queries.iter().map(|q| q.duration_ms).sum());

        let record = PerformanceRecord {
            id: None,
            event_id: item.event.id.to_string(),
            transaction_name: perf.transaction.clone(),
            transaction_type: perf.transaction_type,
            duration_ms: perf.duration_ms,
            db_duration_ms,
            view_duration_ms: perf.view_duration_ms,
            query_count: perf.queries.len() as i64,
            has_n_plus_one: !patterns.is_empty(),
            has_slow_queries: !slow.is_empty(),
            n_plus_one_patterns: patterns,
            slow_queries: slow,
            context: self.scrubber.scrubbed(item.event.context.to_value()),
            environment: item.event.environment.clone(),
            release: item.event.release.clone(),
            captured_at: item.event.captured_at,
        };

        if record.has_n_plus_one {
            tracing::debug!(
                transaction = %record.transaction_name,
                patterns = record.n_plus_one_patterns.len(),
                "N+1 query pattern detected"
            );
        }

        self.db.insert_performance(&record).await?;
        Ok(())
    }

    async fn maybe_alert(&self, outcome: &UpsertOutcome) {
        if !self.alerts.has_channels() || outcome.record.status == ErrorStatus::Ignored {
            return;
        }

        let fingerprint = &outcome.record.fingerprint;
        if !self.throttler.should_alert(fingerprint).await {
            metrics::record_alert("throttled");
            return;
        }
        self.throttler.record(fingerprint).await;
        self.alerts.send(AlertSignal::from_outcome(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{
        AlertChannel, AlertDispatcher, AlertTransport, AlertTrigger, ChannelKind, DEFAULT_MAX_PENDING_ALERTS,
    };
    use crate::buffer::{BufferStore, MemoryBufferStore};
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::clock::ManualClock;
    use crate::error::AlertError;
    use crate::event::{EventContext, QueryExecution, RawEvent};
    use crate::storage::{ErrorFilter, PerformanceFilter};
    use crate::throttle::MemoryThrottleStore;
    use async_trait::async_trait;

    #[derive(Default)]
    struct CountingTransport {
        triggers: Mutex<Vec<AlertTrigger>>,
    }

    #[async_trait]
    impl AlertTransport for CountingTransport {
        async fn deliver(&self, _channel: &AlertChannel, signal: &AlertSignal) -> Result<(), AlertError> {
            self.triggers.lock().unwrap().push(signal.trigger);
            Ok(())
        }
    }

    /// Webhook that hangs far past any shutdown grace
    struct HungTransport;

    #[async_trait]
    impl AlertTransport for HungTransport {
        async fn deliver(&self, _channel: &AlertChannel, _signal: &AlertSignal) -> Result<(), AlertError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct Harness {
        persister: Persister,
        buffer: Arc<EventBuffer>,
        store: Arc<MemoryBufferStore>,
        db: Arc<TelemetryDb>,
        transport: Arc<CountingTransport>,
        clock: ManualClock,
    }

    async fn harness(config: PersisterConfig) -> Harness {
        harness_with(config, None).await
    }

    async fn harness_with(config: PersisterConfig, webhook: Option<Arc<dyn AlertTransport>>) -> Harness {
        let clock = ManualClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryBufferStore::new());
        let breaker = Arc::new(CircuitBreaker::with_clock(
            CircuitBreakerConfig::default(),
            shared_clock.clone(),
        ));
        let buffer = Arc::new(EventBuffer::new(store.clone(), breaker, 10_000, shared_clock.clone()));
        let db = Arc::new(TelemetryDb::connect("sqlite::memory:").await.unwrap());

        let transport = Arc::new(CountingTransport::default());
        let webhook = webhook.unwrap_or_else(|| transport.clone() as Arc<dyn AlertTransport>);
        let dispatcher = Arc::new(
            AlertDispatcher::new(vec![AlertChannel::Webhook {
                url: "https://alerts.test/hook".to_string(),
            }])
            .with_transport(ChannelKind::Webhook, webhook),
        );
        let alerts = AlertOutbox::new(dispatcher, DEFAULT_MAX_PENDING_ALERTS);
        let throttler = Arc::new(AlertThrottler::new(
            Arc::new(MemoryThrottleStore::new(shared_clock.clone())),
            Duration::from_secs(300),
            shared_clock.clone(),
        ));

        let persister = Persister::new(buffer.clone(), db.clone(), throttler, alerts, shared_clock, config);

        Harness {
            persister,
            buffer,
            store,
            db,
            transport,
            clock,
        }
    }

    fn perf_event(i: usize) -> RawEvent {
        RawEvent::performance(format!("Reports#show/{}", i % 3), 10.0 + i as f64)
    }

    #[tokio::test]
    async fn test_cycle_drains_in_batches() {
        let h = harness(PersisterConfig::default()).await;

        for i in 0..150 {
            h.buffer.push(perf_event(i), None).unwrap();
        }

        let report = h.persister.drain_now().await;

        assert_eq!(report.performance.batches, 2);
        assert_eq!(report.performance.drained, 150);
        assert_eq!(report.performance.persisted, 150);
        assert_eq!(h.db.get_stats().await.unwrap().performance_count, 150);
        assert_eq!(h.buffer.len(EventKind::Performance).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cycle_cap_leaves_remainder_for_next_cycle() {
        let config = PersisterConfig {
            batch_size: 10,
            max_per_cycle: 25,
            ..PersisterConfig::default()
        };
        let h = harness(config).await;

        for i in 0..40 {
            h.buffer.push(perf_event(i), None).unwrap();
        }

        let first = h.persister.drain_now().await;
        assert_eq!(first.performance.drained, 25);
        assert_eq!(first.performance.batches, 3);

        let second = h.persister.drain_now().await;
        assert_eq!(second.performance.drained, 15);
        assert_eq!(h.db.get_stats().await.unwrap().performance_count, 40);
    }

    #[tokio::test]
    async fn test_malformed_item_does_not_abort_batch() {
        let h = harness(PersisterConfig::default()).await;

        h.buffer.push(RawEvent::error("KeyError", "key not found: :a"), None).unwrap();
        h.buffer.settle().await;
        h.store
            .push(EventKind::Error, u64::MAX - 1, "{\"garbage\":".to_string(), 10_000)
            .await
            .unwrap();
        h.buffer.push(RawEvent::error("KeyError", "key not found: :b"), None).unwrap();

        let report = h.persister.drain_now().await;

        assert_eq!(report.errors.drained, 3);
        assert_eq!(report.errors.malformed, 1);
        assert_eq!(report.errors.persisted, 2);
    }

    #[tokio::test]
    async fn test_errors_aggregate_and_alerts_are_throttled() {
        let h = harness(PersisterConfig::default()).await;

        for i in 0..5 {
            let event = RawEvent::error("Net::ReadTimeout", format!("timed out after {}s", i + 1));
            let fingerprint = FingerprintGenerator::new().generate("Net::ReadTimeout", Some("timed out after 1s"), &[]);
            h.buffer.push(event, Some(fingerprint)).unwrap();
        }
        h.persister.drain_now().await;
        h.persister.settle_alerts().await;

        let errors = h.db.query_errors(&ErrorFilter::default()).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].occurrence_count, 5);
        assert_eq!(*h.transport.triggers.lock().unwrap(), vec![AlertTrigger::NewIssue]);

        // Window passes and the issue was resolved meanwhile
        h.clock.advance(Duration::from_secs(301));
        h.db.set_status(&errors[0].fingerprint, ErrorStatus::Resolved).await.unwrap();
        h.buffer
            .push(RawEvent::error("Net::ReadTimeout", "timed out after 9s"), None)
            .unwrap();
        h.persister.drain_now().await;
        h.persister.settle_alerts().await;

        assert_eq!(
            *h.transport.triggers.lock().unwrap(),
            vec![AlertTrigger::NewIssue, AlertTrigger::Reopened]
        );
    }

    #[tokio::test]
    async fn test_performance_record_flags_and_scrubs() {
        let config = PersisterConfig {
            slow_query_threshold_ms: 50.0,
            ..PersisterConfig::default()
        };
        let h = harness(config).await;

        let queries = vec![
            QueryExecution::new("SELECT * FROM posts", 3.0),
            QueryExecution::new("SELECT * FROM users WHERE id = 1", 2.0),
            QueryExecution::new("SELECT * FROM users WHERE id = 2", 2.0),
            QueryExecution::new("SELECT * FROM users WHERE id = 3", 75.0),
        ];
        let context = EventContext::default().with_extra("api_key", serde_json::json!("sk-live-123"));
        let event = RawEvent::performance("Posts#index", 120.0)
            .with_queries(queries)
            .with_context(context);
        h.buffer.push(event, None).unwrap();
        h.persister.drain_now().await;

        let records = h.db.query_performance(&PerformanceFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.query_count, 4);
        assert_eq!(record.db_duration_ms, 82.0);
        assert!(record.has_n_plus_one);
        assert_eq!(record.n_plus_one_patterns[0].count, 3);
        assert!(record.has_slow_queries);
        assert_eq!(record.slow_queries.len(), 1);
        assert_eq!(record.context["extra"]["api_key"], crate::scrub::FILTERED);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_bounded() {
        let config = PersisterConfig {
            interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(2),
            ..PersisterConfig::default()
        };
        let h = harness(config).await;

        assert!(h.persister.start());
        assert!(!h.persister.start());
        assert!(h.persister.is_running());

        for i in 0..20 {
            h.buffer.push(perf_event(i), None).unwrap();
        }

        assert!(h.persister.stop().await);
        assert!(!h.persister.is_running());
        assert_eq!(h.db.get_stats().await.unwrap().performance_count, 20);

        // Restart after stop
        assert!(h.persister.start());
        assert!(h.persister.stop().await);
    }

    #[tokio::test]
    async fn test_hung_alert_transport_does_not_hold_up_drain_or_stop() {
        let config = PersisterConfig {
            interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(1),
            ..PersisterConfig::default()
        };
        let h = harness_with(config, Some(Arc::new(HungTransport))).await;

        for i in 0..4 {
            h.buffer
                .push(RawEvent::error(format!("Upstream{}Error", i), "bad gateway"), None)
                .unwrap();
        }
        let started = std::time::Instant::now();
        let report = h.persister.drain_now().await;
        assert_eq!(report.errors.persisted, 4);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.persister.pending_alerts(), 4);

        // Errors captured while deliveries hang still make it through a bounded stop
        assert!(h.persister.start());
        for i in 4..8 {
            h.buffer
                .push(RawEvent::error(format!("Upstream{}Error", i), "bad gateway"), None)
                .unwrap();
        }
        assert!(h.persister.stop().await);

        let stats = h.db.get_stats().await.unwrap();
        assert_eq!(stats.error_count, 8);
        assert_eq!(h.persister.pending_alerts(), 8);
    }

    #[tokio::test]
    async fn test_cycle_purges_closed_throttle_windows() {
        let h = harness(PersisterConfig::default()).await;

        for i in 0..200 {
            h.buffer
                .push(RawEvent::error(format!("Job{}Error", i), "failed"), None)
                .unwrap();
        }
        h.persister.drain_now().await;
        assert_eq!(h.persister.throttled_fingerprints().await, 200);

        // The old fingerprints never recur; the next cycle still drops them
        h.clock.advance(Duration::from_secs(301));
        h.buffer.push(RawEvent::error("FreshError", "failed"), None).unwrap();
        h.persister.drain_now().await;

        assert_eq!(h.persister.throttled_fingerprints().await, 1);
        h.persister.settle_alerts().await;
        assert_eq!(h.transport.triggers.lock().unwrap().len(), 201);
    }
}
