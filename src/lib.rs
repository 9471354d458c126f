pub mod aggregator;
pub mod alerts;
pub mod buffer;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod fingerprint;
mod in_flight;
pub mod metrics;
pub mod persister;
pub mod pipeline;
pub mod query_patterns;
pub mod scrub;
pub mod signals;
pub mod storage;
pub mod throttle;

pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use event::{EventContext, QueryExecution, RawEvent, Severity, StackFrame};
pub use pipeline::{CaptureOutcome, PipelineStats, Telemetry, TelemetryBuilder};

use config::LogFormat;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` overrides the default `info` filter. Can only be called once
/// per process.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}
