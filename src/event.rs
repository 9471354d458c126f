//! Producer-facing event types
//!
//! A [`RawEvent`] is handed over by the host framework's instrumentation.
//! Its shape is checked once, at the boundary, by [`RawEvent::validate`];
//! anything that passes is safe to push through the rest of the pipeline.

use crate::error::CaptureError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Event class; each class has its own buffer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Error,
    Performance,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Error, EventKind::Performance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Performance => "performance",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a backtrace, most recent first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

impl StackFrame {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            function: Some(function.into()),
        }
    }

    /// Parse a conventional `path:line:in 'method'` backtrace line
    ///
    /// Lines that do not carry a line number are kept whole as the file.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let mut parts = raw.splitn(3, ':');
        let file = parts.next().unwrap_or_default();
        let line = parts.next().and_then(|l| l.trim().parse::<u32>().ok());

        match line {
            Some(line) => {
                let function = parts.next().map(|rest| {
                    rest.trim()
                        .trim_start_matches("in ")
                        .trim_matches(|c| c == '`' || c == '\'')
                        .to_string()
                });
                Self {
                    file: file.to_string(),
                    line: Some(line),
                    function: function.filter(|f| !f.is_empty()),
                }
            }
            None => Self {
                file: raw.to_string(),
                line: None,
                function: None,
            },
        }
    }

    /// `file:line`, the form used for grouping
    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.file, line),
            None => self.file.clone(),
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{}:in `{}`", self.location(), function),
            None => f.write_str(&self.location()),
        }
    }
}

/// A single query executed during a performance trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecution {
    pub sql: String,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl QueryExecution {
    pub fn new(sql: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            sql: sql.into(),
            duration_ms,
            name: None,
        }
    }
}

/// Request metadata attached by the host framework
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
}

/// Structured context passed explicitly with each event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestInfo>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl EventContext {
    pub fn request_path(&self) -> Option<&str> {
        self.request.as_ref().and_then(|r| r.path.as_deref())
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_request_path(mut self, path: impl Into<String>) -> Self {
        self.request.get_or_insert_with(RequestInfo::default).path = Some(path.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Render as a JSON object for storage
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Error-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub exception_type: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub frames: Vec<StackFrame>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub handled: bool,
}

/// Transaction classification for performance traces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Request,
    Job,
    Custom,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Job => "job",
            Self::Custom => "custom",
        }
    }
}

/// Performance-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePayload {
    pub transaction: String,
    #[serde(default)]
    pub transaction_type: TransactionType,
    pub duration_ms: f64,
    #[serde(default)]
    pub db_duration_ms: Option<f64>,
    #[serde(default)]
    pub view_duration_ms: Option<f64>,
    #[serde(default)]
    pub queries: Vec<QueryExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Error(ErrorPayload),
    Performance(PerformancePayload),
}

/// Event as supplied by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default)]
    pub context: EventContext,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

impl RawEvent {
    pub fn error(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_payload(EventPayload::Error(ErrorPayload {
            exception_type: exception_type.into(),
            message: Some(message.into()),
            frames: Vec::new(),
            severity: Severity::default(),
            handled: false,
        }))
    }

    pub fn performance(transaction: impl Into<String>, duration_ms: f64) -> Self {
        Self::from_payload(EventPayload::Performance(PerformancePayload {
            transaction: transaction.into(),
            transaction_type: TransactionType::default(),
            duration_ms,
            db_duration_ms: None,
            view_duration_ms: None,
            queries: Vec::new(),
        }))
    }

    fn from_payload(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            context: EventContext::default(),
            captured_at: Utc::now(),
            environment: None,
            release: None,
        }
    }

    /// Decode a producer-supplied JSON event and check its shape
    pub fn from_json(raw: &str) -> Result<Self, CaptureError> {
        let event: RawEvent = serde_json::from_str(raw)?;
        event.validate()?;
        Ok(event)
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        if let EventPayload::Error(ref mut err) = self.payload {
            err.frames = frames;
        }
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        if let EventPayload::Error(ref mut err) = self.payload {
            err.severity = severity;
        }
        self
    }

    pub fn with_queries(mut self, queries: Vec<QueryExecution>) -> Self {
        if let EventPayload::Performance(ref mut perf) = self.payload {
            perf.queries = queries;
        }
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = at;
        self
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::Performance(_) => EventKind::Performance,
        }
    }

    /// Check the event's shape before it enters the pipeline
    pub fn validate(&self) -> Result<(), CaptureError> {
        match &self.payload {
            EventPayload::Error(err) => {
                if err.exception_type.trim().is_empty() {
                    return Err(CaptureError::Malformed(
                        "error event requires an exception type".to_string(),
                    ));
                }
                if err.frames.iter().any(|f| f.file.trim().is_empty()) {
                    return Err(CaptureError::Malformed(
                        "stack frame without a file path".to_string(),
                    ));
                }
            }
            EventPayload::Performance(perf) => {
                if perf.transaction.trim().is_empty() {
                    return Err(CaptureError::Malformed(
                        "performance event requires a transaction name".to_string(),
                    ));
                }
                if !is_valid_duration(perf.duration_ms) {
                    return Err(CaptureError::Malformed(format!(
                        "invalid transaction duration: {}",
                        perf.duration_ms
                    )));
                }
                for timing in [perf.db_duration_ms, perf.view_duration_ms].into_iter().flatten() {
                    if !is_valid_duration(timing) {
                        return Err(CaptureError::Malformed(format!(
                            "invalid sub-timing: {}",
                            timing
                        )));
                    }
                }
                if let Some(query) = perf.queries.iter().find(|q| !is_valid_duration(q.duration_ms)) {
                    return Err(CaptureError::Malformed(format!(
                        "invalid query duration: {}",
                        query.duration_ms
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_valid_duration(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Event as held by the buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedItem {
    pub event: RawEvent,
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_frame_parse() {
        let frame = StackFrame::parse("app/models/user.rb:42:in `full_name'");
        assert_eq!(frame.file, "app/models/user.rb");
        assert_eq!(frame.line, Some(42));
        assert_eq!(frame.function.as_deref(), Some("full_name"));

        let frame = StackFrame::parse("<internal:kernel>");
        assert_eq!(frame.file, "<internal:kernel>");
        assert_eq!(frame.line, None);
    }

    #[test]
    fn test_validate_rejects_empty_exception_type() {
        let event = RawEvent::error("  ", "boom");
        assert!(matches!(event.validate(), Err(CaptureError::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_negative_duration() {
        let event = RawEvent::performance("UsersController#index", -1.0);
        assert!(event.validate().is_err());

        let event = RawEvent::performance("UsersController#index", f64::NAN);
        assert!(event.validate().is_err());

        let event = RawEvent::performance("UsersController#index", 12.5)
            .with_queries(vec![QueryExecution::new("SELECT 1", f64::INFINITY)]);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_from_json_roundtrip_shape() {
        let raw = r#"{
            "kind": "error",
            "exception_type": "NoMethodError",
            "message": "undefined method `name' for nil",
            "frames": [{"file": "app/models/user.rb", "line": 10}],
            "context": {"tags": {"region": "eu"}, "request": {"path": "/users/1"}},
            "captured_at": "2024-05-01T12:00:00Z"
        }"#;

        let event = RawEvent::from_json(raw).unwrap();
        assert_eq!(event.kind(), EventKind::Error);
        assert_eq!(event.context.request_path(), Some("/users/1"));
        match event.payload {
            EventPayload::Error(err) => {
                assert_eq!(err.exception_type, "NoMethodError");
                assert_eq!(err.severity, Severity::Error);
                assert!(!err.handled);
            }
            _ => panic!("Expected error payload"),
        }
    }

    #[test]
    fn test_from_json_fails_fast_on_wrong_shape() {
        let missing_kind = r#"{"exception_type": "X", "captured_at": "2024-05-01T12:00:00Z"}"#;
        assert!(matches!(
            RawEvent::from_json(missing_kind),
            Err(CaptureError::Decode(_))
        ));

        let missing_duration = r#"{"kind": "performance", "transaction": "t", "captured_at": "2024-05-01T12:00:00Z"}"#;
        assert!(RawEvent::from_json(missing_duration).is_err());
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("WARN"), Some(Severity::Warning));
        assert_eq!(Severity::parse("fatal"), Some(Severity::Fatal));
        assert_eq!(Severity::parse("loud"), None);
    }
}
