//! Error fingerprinting
//!
//! Errors are grouped by a SHA-256 digest of their exception type, their
//! message with variable data masked out, and the first stack frame that
//! belongs to application code.

use crate::event::StackFrame;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid uuid pattern")
});

static QUOTED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#).expect("valid quoted string pattern")
});

static NUMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid number pattern"));

/// Path fragments that mark a frame as framework or library code
const LIBRARY_PATH_MARKERS: &[&str] = &[
    "/gems/",
    "/vendor/",
    "/lib/ruby/",
    "/node_modules/",
    "/site-packages/",
    "/.cargo/registry/",
    "/rustc/",
    "<internal:",
];

/// Derives grouping keys for error events
#[derive(Debug, Clone)]
pub struct FingerprintGenerator {
    library_markers: Vec<String>,
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self {
            library_markers: LIBRARY_PATH_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl FingerprintGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add extra path fragments that identify non-application frames
    pub fn with_library_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.library_markers.extend(markers.into_iter().map(Into::into));
        self
    }

    /// Compute the fingerprint for an error
    pub fn generate(&self, exception_type: &str, message: Option<&str>, frames: &[StackFrame]) -> String {
        let normalized = message.map(normalize_message).unwrap_or_default();
        let top_frame = self
            .top_frame(frames)
            .map(StackFrame::location)
            .unwrap_or_default();

        let material = format!("{}\n{}\n{}", exception_type, normalized, top_frame);
        sha256_hex(material.as_bytes())
    }

    /// First application frame, falling back to the first frame
    pub fn top_frame<'a>(&self, frames: &'a [StackFrame]) -> Option<&'a StackFrame> {
        frames
            .iter()
            .find(|frame| self.is_application_frame(frame))
            .or_else(|| frames.first())
    }

    fn is_application_frame(&self, frame: &StackFrame) -> bool {
        !self
            .library_markers
            .iter()
            .any(|marker| frame.file.contains(marker.as_str()))
    }
}

/// Mask UUIDs, quoted strings and numbers with fixed placeholders
pub fn normalize_message(message: &str) -> String {
    let masked = UUID_PATTERN.replace_all(message, "{uuid}");
    let masked = QUOTED_PATTERN.replace_all(&masked, "{string}");
    NUMBER_PATTERN.replace_all(&masked, "{number}").into_owned()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
