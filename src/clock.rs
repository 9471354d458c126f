//! Time source abstraction
//!
//! Components that make time-based decisions (circuit recovery, alert
//! throttling, first/last-seen timestamps) take an `Arc<dyn Clock>` so tests
//! can advance time without sleeping.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of wall-clock and monotonic time
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant
    fn instant(&self) -> Instant;
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests
///
/// Both the wall-clock and the monotonic reading move together when
/// [`ManualClock::advance`] is called. Wall-clock readings are truncated to
/// whole milliseconds, matching the precision records are stored with.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start_time: DateTime<Utc>,
    start_instant: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start_time: truncate_millis(start),
            start_instant: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or(Duration::ZERO)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        truncate_millis(self.start_time + elapsed)
    }

    fn instant(&self) -> Instant {
        self.start_instant + self.elapsed()
    }
}

/// Convert stored Unix milliseconds back into a timestamp
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(ts.timestamp_millis())
}
