//! Alert dispatch
//!
//! Channels are a closed set of variants. Each variant kind maps to one
//! registered [`AlertTransport`] through a lookup table; only the log
//! transport ships with the crate, the others are provided by the host.
//!
//! The persister never waits on a transport. Signals go through an
//! [`AlertOutbox`], which delivers each one on a detached task.

use crate::aggregator::UpsertOutcome;
use crate::error::{AlertError, ConfigError};
use crate::in_flight::{InFlight, InFlightGuard};
use crate::metrics;
use crate::storage::ErrorRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Deliveries allowed to run at once before new alerts are dropped
pub const DEFAULT_MAX_PENDING_ALERTS: usize = 64;

/// Level used by the log channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    #[default]
    Warn,
    Error,
}

/// A configured alert destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertChannel {
    Webhook {
        url: String,
    },
    Slack {
        webhook_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Email {
        recipients: Vec<String>,
    },
    Log {
        #[serde(default)]
        level: AlertLevel,
    },
}

impl AlertChannel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Webhook { .. } => ChannelKind::Webhook,
            Self::Slack { .. } => ChannelKind::Slack,
            Self::Email { .. } => ChannelKind::Email,
            Self::Log { .. } => ChannelKind::Log,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = match self {
            Self::Webhook { url } => url.trim().is_empty(),
            Self::Slack { webhook_url, .. } => webhook_url.trim().is_empty(),
            Self::Email { recipients } => {
                recipients.is_empty() || recipients.iter().any(|r| r.trim().is_empty())
            }
            Self::Log { .. } => false,
        };

        if missing {
            return Err(ConfigError::Invalid(format!(
                "{} alert channel has no destination",
                self.kind()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Webhook,
    Slack,
    Email,
    Log,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Slack => "slack",
            Self::Email => "email",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an alert is being raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTrigger {
    NewIssue,
    Reopened,
    Recurrence,
}

impl AlertTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewIssue => "new_issue",
            Self::Reopened => "reopened",
            Self::Recurrence => "recurrence",
        }
    }
}

/// Payload handed to transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSignal {
    pub trigger: AlertTrigger,
    pub record: ErrorRecord,
}

impl AlertSignal {
    pub fn from_outcome(outcome: &UpsertOutcome) -> Self {
        let trigger = if outcome.created {
            AlertTrigger::NewIssue
        } else if outcome.reopened() {
            AlertTrigger::Reopened
        } else {
            AlertTrigger::Recurrence
        };

        Self {
            trigger,
            record: outcome.record.clone(),
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let message = self.record.message.as_deref().unwrap_or("(no message)");
        format!(
            "[{}] {}: {} ({} occurrences)",
            self.trigger.as_str(),
            self.record.exception_type,
            message,
            self.record.occurrence_count
        )
    }
}

/// Sends alerts for one channel kind
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, channel: &AlertChannel, signal: &AlertSignal) -> Result<(), AlertError>;
}

/// Writes alerts to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    async fn deliver(&self, channel: &AlertChannel, signal: &AlertSignal) -> Result<(), AlertError> {
        let level = match channel {
            AlertChannel::Log { level } => *level,
            other => {
                return Err(AlertError::Delivery(format!(
                    "log transport cannot deliver to {} channels",
                    other.kind()
                )))
            }
        };

        let record = &signal.record;
        match level {
            AlertLevel::Info => tracing::info!(
                fingerprint = %record.fingerprint,
                trigger = signal.trigger.as_str(),
                occurrences = record.occurrence_count,
                "{}", signal.summary()
            ),
            AlertLevel::Warn => tracing::warn!(
                fingerprint = %record.fingerprint,
                trigger = signal.trigger.as_str(),
                occurrences = record.occurrence_count,
                "{}", signal.summary()
            ),
            AlertLevel::Error => tracing::error!(
                fingerprint = %record.fingerprint,
                trigger = signal.trigger.as_str(),
                occurrences = record.occurrence_count,
                "{}", signal.summary()
            ),
        }

        Ok(())
    }
}

/// Per-dispatch counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct AlertDispatcher {
    channels: Vec<AlertChannel>,
    transports: HashMap<ChannelKind, Arc<dyn AlertTransport>>,
    timeout: Duration,
}

impl AlertDispatcher {
    /// Dispatcher with the built-in log transport registered
    pub fn new(channels: Vec<AlertChannel>) -> Self {
        let mut transports: HashMap<ChannelKind, Arc<dyn AlertTransport>> = HashMap::new();
        transports.insert(ChannelKind::Log, Arc::new(LogTransport));

        Self {
            channels,
            transports,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Register (or replace) the transport for a channel kind
    pub fn with_transport(mut self, kind: ChannelKind, transport: Arc<dyn AlertTransport>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Send a signal to every configured channel
    ///
    /// Failures are logged and counted; they never propagate.
    pub async fn dispatch(&self, signal: &AlertSignal) -> DispatchReport {
        let mut report = DispatchReport::default();

        for channel in &self.channels {
            match self.deliver(channel, signal).await {
                Ok(()) => {
                    report.delivered += 1;
                    metrics::record_alert("delivered");
                }
                Err(AlertError::NoTransport(kind)) => {
                    report.skipped += 1;
                    metrics::record_alert("skipped");
                    tracing::warn!(
                        channel = %kind,
                        fingerprint = %signal.record.fingerprint,
                        "No transport registered for alert channel, skipping"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::record_alert("failed");
                    tracing::error!(
                        channel = %channel.kind(),
                        fingerprint = %signal.record.fingerprint,
                        error = %e,
                        "Alert delivery failed"
                    );
                }
            }
        }

        report
    }

    async fn deliver(&self, channel: &AlertChannel, signal: &AlertSignal) -> Result<(), AlertError> {
        let kind = channel.kind();
        let transport = self
            .transports
            .get(&kind)
            .ok_or(AlertError::NoTransport(kind))?;

        tokio::time::timeout(self.timeout, transport.deliver(channel, signal))
            .await
            .map_err(|_| AlertError::Timeout)?
    }
}

/// Runs alert delivery off the caller's task
///
/// At most `capacity` deliveries run at once. Alerts past that are dropped
/// and counted, so a hung transport costs a bounded number of tasks.
pub struct AlertOutbox {
    dispatcher: Arc<AlertDispatcher>,
    permits: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
}

impl AlertOutbox {
    pub fn new(dispatcher: Arc<AlertDispatcher>, capacity: usize) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn has_channels(&self) -> bool {
        self.dispatcher.has_channels()
    }

    /// Hand a signal to a detached delivery task
    ///
    /// Returns false if the alert was dropped instead.
    pub fn send(&self, signal: AlertSignal) -> bool {
        let Ok(handle) = Handle::try_current() else {
            metrics::record_alert("dropped");
            tracing::warn!(fingerprint = %signal.record.fingerprint, "No tokio runtime, alert dropped");
            return false;
        };

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            metrics::record_alert("dropped");
            tracing::warn!(
                fingerprint = %signal.record.fingerprint,
                pending = self.pending(),
                "Too many alert deliveries pending, alert dropped"
            );
            return false;
        };

        let guard = InFlightGuard::enter(&self.in_flight);
        let dispatcher = self.dispatcher.clone();

        handle.spawn(async move {
            let _guard = guard;
            let _permit = permit;

            let report = dispatcher.dispatch(&signal).await;
            tracing::debug!(
                fingerprint = %signal.record.fingerprint,
                trigger = signal.trigger.as_str(),
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                "Alert dispatched"
            );
        });

        true
    }

    /// Deliveries still running
    pub fn pending(&self) -> usize {
        self.in_flight.count()
    }

    /// Wait until every delivery started so far has finished
    pub async fn settle(&self) {
        self.in_flight.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use crate::storage::ErrorStatus;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        delivered: Mutex<Vec<(ChannelKind, AlertTrigger)>>,
    }

    #[async_trait]
    impl AlertTransport for RecordingTransport {
        async fn deliver(&self, channel: &AlertChannel, signal: &AlertSignal) -> Result<(), AlertError> {
            self.delivered.lock().unwrap().push((channel.kind(), signal.trigger));
            Ok(())
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl AlertTransport for StalledTransport {
        async fn deliver(&self, _channel: &AlertChannel, _signal: &AlertSignal) -> Result<(), AlertError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn signal(trigger: AlertTrigger) -> AlertSignal {
        let now = Utc::now();
        AlertSignal {
            trigger,
            record: ErrorRecord {
                id: 1,
                fingerprint: "fp-1".to_string(),
                exception_type: "NoMethodError".to_string(),
                message: Some("undefined method `name' for nil".to_string()),
                backtrace: Vec::new(),
                context: json!({}),
                severity: Severity::Error,
                handled: false,
                occurrence_count: 3,
                first_seen_at: now,
                last_seen_at: now,
                status: ErrorStatus::Unresolved,
                environment: None,
                release: None,
            },
        }
    }

    #[test]
    fn test_channel_config_deserializes_by_type_tag() {
        let channels: Vec<AlertChannel> = serde_json::from_value(json!([
            {"type": "slack", "webhook_url": "https://hooks.slack.test/x", "channel": "#ops"},
            {"type": "email", "recipients": ["oncall@example.com"]},
            {"type": "log"}
        ]))
        .unwrap();

        assert_eq!(channels[0].kind(), ChannelKind::Slack);
        assert_eq!(channels[1].kind(), ChannelKind::Email);
        assert_eq!(channels[2], AlertChannel::Log { level: AlertLevel::Warn });
    }

    #[test]
    fn test_channel_validation() {
        let empty = AlertChannel::Email { recipients: vec![] };
        assert!(empty.validate().is_err());

        let webhook = AlertChannel::Webhook { url: " ".to_string() };
        let err = webhook.validate().unwrap_err();
        assert!(err.to_string().contains("webhook"));

        assert!(AlertChannel::Log { level: AlertLevel::Info }.validate().is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind_and_skips_unregistered() {
        let slack = Arc::new(RecordingTransport::default());
        let dispatcher = AlertDispatcher::new(vec![
            AlertChannel::Slack {
                webhook_url: "https://hooks.slack.test/x".to_string(),
                channel: None,
            },
            AlertChannel::Webhook {
                url: "https://example.test/hook".to_string(),
            },
            AlertChannel::Log { level: AlertLevel::Error },
        ])
        .with_transport(ChannelKind::Slack, slack.clone());

        let report = dispatcher.dispatch(&signal(AlertTrigger::NewIssue)).await;

        assert_eq!(
            report,
            DispatchReport {
                delivered: 2,
                failed: 0,
                skipped: 1
            }
        );
        assert_eq!(
            *slack.delivered.lock().unwrap(),
            vec![(ChannelKind::Slack, AlertTrigger::NewIssue)]
        );
    }

    #[tokio::test]
    async fn test_slow_transport_times_out() {
        let dispatcher = AlertDispatcher::new(vec![AlertChannel::Webhook {
            url: "https://example.test/hook".to_string(),
        }])
        .with_transport(ChannelKind::Webhook, Arc::new(StalledTransport))
        .with_timeout(Duration::from_millis(20));

        let report = dispatcher.dispatch(&signal(AlertTrigger::Recurrence)).await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_outbox_send_does_not_wait_for_delivery() {
        let dispatcher = AlertDispatcher::new(vec![AlertChannel::Webhook {
            url: "https://example.test/hook".to_string(),
        }])
        .with_transport(ChannelKind::Webhook, Arc::new(StalledTransport))
        .with_timeout(Duration::from_millis(200));
        let outbox = AlertOutbox::new(Arc::new(dispatcher), 2);

        let started = std::time::Instant::now();
        assert!(outbox.send(signal(AlertTrigger::NewIssue)));
        assert!(outbox.send(signal(AlertTrigger::Reopened)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(outbox.pending(), 2);

        // Both slots are taken by stalled deliveries
        assert!(!outbox.send(signal(AlertTrigger::Recurrence)));

        tokio::time::timeout(Duration::from_secs(5), outbox.settle())
            .await
            .expect("deliveries end at the transport timeout");
        assert_eq!(outbox.pending(), 0);
        assert!(outbox.send(signal(AlertTrigger::Recurrence)));
    }

    #[tokio::test]
    async fn test_outbox_delivers_in_background() {
        let webhook = Arc::new(RecordingTransport::default());
        let dispatcher = AlertDispatcher::new(vec![AlertChannel::Webhook {
            url: "https://example.test/hook".to_string(),
        }])
        .with_transport(ChannelKind::Webhook, webhook.clone());
        let outbox = AlertOutbox::new(Arc::new(dispatcher), DEFAULT_MAX_PENDING_ALERTS);

        assert!(outbox.has_channels());
        assert!(outbox.send(signal(AlertTrigger::NewIssue)));
        outbox.settle().await;

        assert_eq!(
            *webhook.delivered.lock().unwrap(),
            vec![(ChannelKind::Webhook, AlertTrigger::NewIssue)]
        );
    }

    #[test]
    fn test_outbox_without_runtime_drops() {
        let outbox = AlertOutbox::new(Arc::new(AlertDispatcher::new(vec![])), 1);
        assert!(!outbox.send(signal(AlertTrigger::NewIssue)));
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn test_summary_mentions_trigger_and_count() {
        let summary = signal(AlertTrigger::Reopened).summary();
        assert!(summary.starts_with("[reopened] NoMethodError"));
        assert!(summary.ends_with("(3 occurrences)"));
    }
}
