/// End-to-end tests: capture through buffer, persister and storage
use async_trait::async_trait;
use faultline::alerts::{AlertChannel, AlertSignal, AlertTransport, AlertTrigger, ChannelKind};
use faultline::clock::ManualClock;
use faultline::config::BufferBackend;
use faultline::error::AlertError;
use faultline::event::EventContext;
use faultline::storage::{ErrorFilter, ErrorStatus, PerformanceFilter, TelemetryDb};
use faultline::{CaptureOutcome, Config, QueryExecution, RawEvent, StackFrame, Telemetry};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Webhook endpoint that accepts the connection and never answers
struct HangingTransport;

#[async_trait]
impl AlertTransport for HangingTransport {
    async fn deliver(&self, _channel: &AlertChannel, _signal: &AlertSignal) -> Result<(), AlertError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTransport {
    signals: Mutex<Vec<AlertSignal>>,
}

impl RecordingTransport {
    fn triggers(&self) -> Vec<AlertTrigger> {
        self.signals.lock().unwrap().iter().map(|s| s.trigger).collect()
    }
}

#[async_trait]
impl AlertTransport for RecordingTransport {
    async fn deliver(&self, _channel: &AlertChannel, signal: &AlertSignal) -> Result<(), AlertError> {
        self.signals.lock().unwrap().push(signal.clone());
        Ok(())
    }
}

fn webhook_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        alert_channels: vec![AlertChannel::Webhook {
            url: "https://alerts.example.com/hook".to_string(),
        }],
        ..Config::default()
    }
}

fn checkout_error() -> RawEvent {
    RawEvent::error("PaymentGateway::Timeout", "gateway timed out after 5003ms")
        .with_frames(vec![
            StackFrame::new("app/services/charge.rb", 41, "call"),
            StackFrame::new("app/controllers/checkout_controller.rb", 12, "create"),
        ])
        .with_context(EventContext::default().with_request_path("/checkout"))
}

#[tokio::test]
async fn test_repeated_error_is_aggregated_into_one_record() {
    let clock = ManualClock::new();
    let transport = Arc::new(RecordingTransport::default());
    let telemetry = Telemetry::builder(webhook_config())
        .clock(Arc::new(clock.clone()))
        .transport(ChannelKind::Webhook, transport.clone())
        .build()
        .await
        .unwrap();

    for _ in 0..150 {
        telemetry.capture(checkout_error());
    }

    let report = telemetry.flush().await;
    assert_eq!(report.drained, 150);
    assert_eq!(report.persisted, 150);
    assert_eq!(report.failed, 0);

    let errors = telemetry.db().query_errors(&ErrorFilter::default()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].occurrence_count, 150);
    assert_eq!(errors[0].status, ErrorStatus::Unresolved);
    assert_eq!(errors[0].context["request"]["path"], json!("/checkout"));

    telemetry.settle_alerts().await;
    // One alert for the new issue; the recurrences fall inside the throttle window
    assert_eq!(transport.triggers(), vec![AlertTrigger::NewIssue]);
}

#[tokio::test]
async fn test_resolved_error_reopens_and_alerts_again() {
    let clock = ManualClock::new();
    let transport = Arc::new(RecordingTransport::default());
    let telemetry = Telemetry::builder(webhook_config())
        .clock(Arc::new(clock.clone()))
        .transport(ChannelKind::Webhook, transport.clone())
        .build()
        .await
        .unwrap();

    telemetry.capture(checkout_error());
    telemetry.flush().await;

    let fingerprint = telemetry.db().query_errors(&ErrorFilter::default()).await.unwrap()[0]
        .fingerprint
        .clone();
    assert!(telemetry.db().set_status(&fingerprint, ErrorStatus::Resolved).await.unwrap());

    clock.advance(Duration::from_secs(301));
    telemetry.capture(checkout_error());
    telemetry.flush().await;

    let record = telemetry.db().get_error(&fingerprint).await.unwrap().unwrap();
    assert_eq!(record.status, ErrorStatus::Unresolved);
    assert_eq!(record.occurrence_count, 2);
    telemetry.settle_alerts().await;
    assert_eq!(transport.triggers(), vec![AlertTrigger::NewIssue, AlertTrigger::Reopened]);
}

#[tokio::test]
async fn test_distinct_messages_with_variable_parts_share_fingerprint() {
    let telemetry = Telemetry::builder(webhook_config()).build().await.unwrap();

    for id in [101, 202, 303] {
        telemetry.capture(
            RawEvent::error("ActiveRecord::RecordNotFound", format!("Couldn't find User with 'id'={}", id))
                .with_frames(vec![StackFrame::new("app/controllers/users_controller.rb", 7, "show")]),
        );
    }
    telemetry.capture(
        RawEvent::error("ActiveRecord::RecordNotFound", "Couldn't find User with 'id'=9")
            .with_frames(vec![StackFrame::new("app/controllers/admin_controller.rb", 30, "show")]),
    );

    telemetry.flush().await;

    let stats = telemetry.db().get_stats().await.unwrap();
    assert_eq!(stats.error_count, 2);
    assert_eq!(stats.occurrence_total, 4);
}

#[tokio::test]
async fn test_performance_trace_flags_n_plus_one_and_slow_queries() {
    let telemetry = Telemetry::builder(webhook_config()).build().await.unwrap();

    let mut queries: Vec<QueryExecution> = (1..=6)
        .map(|id| QueryExecution::new(format!("SELECT * FROM comments WHERE post_id = {}", id), 2.0))
        .collect();
    queries.push(QueryExecution::new("SELECT * FROM posts ORDER BY created_at DESC", 250.0));

    telemetry.capture(RawEvent::performance("PostsController#index", 420.0).with_queries(queries));
    telemetry.capture(RawEvent::performance("HealthController#show", 1.5));
    telemetry.flush().await;

    let all = telemetry.db().query_performance(&PerformanceFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let flagged = telemetry
        .db()
        .query_performance(&PerformanceFilter {
            flagged_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(flagged.len(), 1);

    let trace = &flagged[0];
    assert_eq!(trace.transaction_name, "PostsController#index");
    assert_eq!(trace.query_count, 7);
    assert!(trace.has_n_plus_one);
    assert!(trace.has_slow_queries);
    assert_eq!(trace.n_plus_one_patterns[0].count, 6);
    assert_eq!(trace.slow_queries.len(), 1);
    assert!((trace.db_duration_ms - 262.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_sqlite_buffer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("telemetry.db").display());
    let config = Config {
        database_url: url.clone(),
        buffer_backend: BufferBackend::Sqlite,
        ..Config::default()
    };

    {
        let telemetry = Telemetry::builder(config.clone()).build().await.unwrap();
        for i in 0..5 {
            let outcome = telemetry.try_capture(RawEvent::performance("Reports#export", 100.0 + i as f64)).unwrap();
            assert_eq!(outcome, CaptureOutcome::Buffered);
        }
        // Let the detached writes land without draining
        while telemetry.stats().await.performance_queue_len < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let telemetry = Telemetry::builder(config).build().await.unwrap();
    assert_eq!(telemetry.stats().await.performance_queue_len, 5);

    let report = telemetry.flush().await;
    assert_eq!(report.persisted, 5);

    let db = TelemetryDb::connect(&url).await.unwrap();
    let stats = db.get_stats().await.unwrap();
    assert_eq!(stats.performance_count, 5);
    assert_eq!(stats.buffered_count, 0);
}

#[tokio::test]
async fn test_background_persister_drains_on_stop() {
    let telemetry = Telemetry::builder(webhook_config()).build().await.unwrap();
    telemetry.start();

    for i in 0..25 {
        telemetry.capture(RawEvent::performance("Jobs::Mailer", i as f64));
    }

    assert!(telemetry.stop().await);

    let stats = telemetry.stats().await;
    assert_eq!(stats.performance_queue_len, 0);
    assert!(!stats.persister_running);
    assert_eq!(telemetry.db().get_stats().await.unwrap().performance_count, 25);
}

#[tokio::test]
async fn test_slow_alert_webhook_does_not_lose_errors_on_stop() {
    let telemetry = Telemetry::builder(webhook_config())
        .transport(ChannelKind::Webhook, Arc::new(HangingTransport))
        .build()
        .await
        .unwrap();
    telemetry.start();

    for service in ["billing", "search", "auth", "mailer"] {
        telemetry.capture(RawEvent::error(format!("{}::Unavailable", service), "connection reset"));
    }

    let started = std::time::Instant::now();
    assert!(telemetry.stop().await);
    assert!(started.elapsed() < Duration::from_secs(2));

    let errors = telemetry.db().query_errors(&ErrorFilter::default()).await.unwrap();
    assert_eq!(errors.len(), 4);

    let stats = telemetry.stats().await;
    assert_eq!(stats.error_queue_len, 0);
    assert_eq!(stats.pending_writes, 0);
    assert_eq!(stats.pending_alerts, 4);
    assert_eq!(stats.throttled_fingerprints, 4);
}

#[tokio::test]
async fn test_throttle_entries_expire_without_recurrence() {
    let clock = ManualClock::new();
    let transport = Arc::new(RecordingTransport::default());
    let telemetry = Telemetry::builder(webhook_config())
        .clock(Arc::new(clock.clone()))
        .transport(ChannelKind::Webhook, transport.clone())
        .build()
        .await
        .unwrap();

    for i in 0..500 {
        telemetry.capture(RawEvent::error(format!("Worker{}Error", i), "crashed"));
    }
    telemetry.flush().await;
    assert_eq!(telemetry.stats().await.throttled_fingerprints, 500);

    clock.advance(Duration::from_secs(3_600));
    for i in 0..10 {
        telemetry.capture(RawEvent::error(format!("Cron{}Error", i), "crashed"));
    }
    telemetry.flush().await;
    telemetry.settle_alerts().await;

    assert_eq!(telemetry.stats().await.throttled_fingerprints, 10);
    assert_eq!(transport.triggers().len(), 510);
}

#[tokio::test]
async fn test_configured_library_markers_skip_instrumentation_frames() {
    let config = Config {
        library_frame_markers: vec!["lib/instrumentation/".to_string()],
        ..webhook_config()
    };
    let telemetry = Telemetry::builder(config).build().await.unwrap();

    // Same failure reached through two different instrumentation wrappers
    for wrapper in ["lib/instrumentation/http.rb", "lib/instrumentation/grpc.rb"] {
        telemetry.capture(RawEvent::error("Timeout::Error", "execution expired").with_frames(vec![
            StackFrame::new(wrapper, 10, "around"),
            StackFrame::new("app/clients/inventory_client.rb", 22, "fetch"),
        ]));
    }
    telemetry.flush().await;

    let errors = telemetry.db().query_errors(&ErrorFilter::default()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].occurrence_count, 2);
}
