//! Error query commands
//!
//! List, inspect and triage aggregated error records.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use colored::{ColoredString, Colorize};
use faultline::storage::{ErrorFilter, ErrorRecord, ErrorStatus, TelemetryDb};
use faultline::{Config, Severity};
use tracing::info;

/// Execute the errors command
pub async fn list(
    cfg: &Config,
    status: Option<String>,
    severity: Option<String>,
    since_hours: Option<u64>,
    limit: usize,
) -> Result<()> {
    let filter = build_filter(status.as_deref(), severity.as_deref(), since_hours, limit)?;
    let db = TelemetryDb::connect(&cfg.database_url).await?;

    let errors = db.query_errors(&filter).await?;
    if errors.is_empty() {
        println!("{}", "No errors found matching the criteria".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} errors", errors.len()).bold());
    println!();

    for record in &errors {
        println!(
            "{} {} {} {}",
            short_fingerprint(&record.fingerprint).cyan(),
            status_label(record.status),
            severity_label(record.severity),
            record.exception_type.bold(),
        );
        if let Some(message) = &record.message {
            println!("    {}", message);
        }
        println!(
            "    {}",
            format!(
                "{} occurrences, last seen {}",
                record.occurrence_count,
                record.last_seen_at.format("%Y-%m-%d %H:%M:%S")
            )
            .dimmed()
        );
    }

    Ok(())
}

/// Execute the show command
pub async fn show(cfg: &Config, fingerprint: &str) -> Result<()> {
    let db = TelemetryDb::connect(&cfg.database_url).await?;

    let Some(record) = db.get_error(fingerprint).await? else {
        return Err(anyhow!("No error with fingerprint {}", fingerprint));
    };

    print_record(&record)?;
    Ok(())
}

/// Execute the resolve and ignore commands
pub async fn set_status(cfg: &Config, fingerprint: &str, status: ErrorStatus) -> Result<()> {
    let db = TelemetryDb::connect(&cfg.database_url).await?;

    if !db.set_status(fingerprint, status).await? {
        return Err(anyhow!("No error with fingerprint {}", fingerprint));
    }

    info!(fingerprint = %fingerprint, status = %status, "Error status updated");
    println!("{} {} marked {}", "✓".green(), fingerprint, status);
    Ok(())
}

fn build_filter(
    status: Option<&str>,
    severity: Option<&str>,
    since_hours: Option<u64>,
    limit: usize,
) -> Result<ErrorFilter> {
    let status = status
        .map(|s| ErrorStatus::parse(s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
        .transpose()?;
    let severity = severity
        .map(|s| Severity::parse(s).ok_or_else(|| anyhow!("Unknown severity '{}'", s)))
        .transpose()?;

    let since = since_hours.map(hours_ago).transpose()?;

    Ok(ErrorFilter {
        status,
        severity,
        since,
        until: None,
        limit: Some(limit),
    })
}

fn hours_ago(hours: u64) -> Result<DateTime<Utc>> {
    let window = i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .ok_or_else(|| anyhow!("--since-hours {} is out of range", hours))?;
    Utc::now()
        .checked_sub_signed(window)
        .ok_or_else(|| anyhow!("--since-hours {} reaches before the earliest representable time", hours))
}

fn print_record(record: &ErrorRecord) -> Result<()> {
    println!("{} {}", "Fingerprint:".bold(), record.fingerprint);
    println!("{} {}", "Type:".bold(), record.exception_type);
    if let Some(message) = &record.message {
        println!("{} {}", "Message:".bold(), message);
    }
    println!("{} {}", "Status:".bold(), status_label(record.status));
    println!("{} {}", "Severity:".bold(), severity_label(record.severity));
    println!("{} {}", "Handled:".bold(), record.handled);
    println!("{} {}", "Occurrences:".bold(), record.occurrence_count);
    println!("{} {}", "First seen:".bold(), record.first_seen_at.to_rfc3339());
    println!("{} {}", "Last seen:".bold(), record.last_seen_at.to_rfc3339());
    if let Some(environment) = &record.environment {
        println!("{} {}", "Environment:".bold(), environment);
    }
    if let Some(release) = &record.release {
        println!("{} {}", "Release:".bold(), release);
    }

    if !record.backtrace.is_empty() {
        println!();
        println!("{}", "Backtrace:".bold());
        for frame in &record.backtrace {
            println!("  {}", frame);
        }
    }

    println!();
    println!("{}", "Context:".bold());
    println!("{}", serde_json::to_string_pretty(&record.context)?);

    Ok(())
}

fn short_fingerprint(fingerprint: &str) -> &str {
    &fingerprint[..12.min(fingerprint.len())]
}

fn status_label(status: ErrorStatus) -> ColoredString {
    match status {
        ErrorStatus::Unresolved => status.as_str().red(),
        ErrorStatus::Resolved => status.as_str().green(),
        ErrorStatus::Ignored => status.as_str().dimmed(),
    }
}

fn severity_label(severity: Severity) -> ColoredString {
    match severity {
        Severity::Fatal | Severity::Error => severity.as_str().red().bold(),
        Severity::Warning => severity.as_str().yellow(),
        _ => severity.as_str().normal(),
    }
}
