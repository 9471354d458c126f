//! Ingest command
//!
//! Replays newline-delimited JSON events through the capture pipeline and
//! flushes the buffer before exiting.

use anyhow::{Context, Result};
use colored::Colorize;
use faultline::{CaptureOutcome, Config, Telemetry};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// Per-outcome counts for one ingest run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: usize,
    pub buffered: usize,
    pub filtered: BTreeMap<&'static str, usize>,
    pub dropped_circuit_open: usize,
    pub invalid: usize,
}

/// Execute the ingest command
pub async fn execute(cfg: Config, file: Option<PathBuf>) -> Result<()> {
    let telemetry = Telemetry::builder(cfg).build().await?;

    let summary = match file.filter(|p| p.as_os_str() != "-") {
        Some(path) => {
            println!("{}", format!("Ingesting events from {}...", path.display()).yellow());
            let handle = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            ingest_lines(&telemetry, BufReader::new(handle)).await?
        }
        None => {
            println!("{}", "Ingesting events from stdin...".yellow());
            ingest_lines(&telemetry, BufReader::new(tokio::io::stdin())).await?
        }
    };

    let flush = telemetry.flush().await;
    info!(
        lines = summary.lines,
        buffered = summary.buffered,
        persisted = flush.persisted,
        "Ingest finished"
    );

    println!();
    println!("{}", "Summary:".bold());
    println!("  Lines read: {}", summary.lines);
    println!("  Buffered: {}", summary.buffered.to_string().green());
    for (reason, count) in &summary.filtered {
        println!("  Filtered ({}): {}", reason, count);
    }
    if summary.dropped_circuit_open > 0 {
        println!("  Dropped (circuit open): {}", summary.dropped_circuit_open.to_string().red());
    }
    if summary.invalid > 0 {
        println!("  Invalid lines: {}", summary.invalid.to_string().red());
    }
    println!(
        "  Persisted: {} ({} failed, {} malformed)",
        flush.persisted.to_string().green(),
        flush.failed,
        flush.malformed
    );

    Ok(())
}

/// Capture every non-blank line of `reader` as one JSON event
pub async fn ingest_lines<R>(telemetry: &Telemetry, reader: R) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.lines += 1;

        match telemetry.try_capture_json(line) {
            Ok(CaptureOutcome::Buffered) => summary.buffered += 1,
            Ok(CaptureOutcome::Filtered(decision)) => {
                *summary.filtered.entry(decision.as_str()).or_default() += 1;
            }
            Ok(CaptureOutcome::DroppedCircuitOpen) => summary.dropped_circuit_open += 1,
            Err(e) => {
                debug!(line = summary.lines, error = %e, "Skipping invalid event");
                eprintln!("{} line {}: {}", "✗".red(), summary.lines, e);
                summary.invalid += 1;
            }
        }
    }

    Ok(summary)
}
