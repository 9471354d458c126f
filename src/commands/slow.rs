use anyhow::Result;
use colored::Colorize;
use faultline::storage::{PerformanceFilter, PerformanceRecord, TelemetryDb};
use faultline::Config;

/// Execute the slow command
///
/// Lists traces flagged with N+1 patterns or slow queries, newest first,
/// followed by duration percentiles for the same scope.
pub async fn execute(cfg: &Config, transaction: Option<String>, limit: usize) -> Result<()> {
    let db = TelemetryDb::connect(&cfg.database_url).await?;

    let filter = PerformanceFilter {
        transaction: transaction.clone(),
        flagged_only: true,
        limit: Some(limit),
        ..Default::default()
    };
    let records = db.query_performance(&filter).await?;

    if records.is_empty() {
        println!("{}", "No flagged traces found".yellow());
    } else {
        println!("{}", format!("Found {} flagged traces", records.len()).bold());
        println!();
        for record in &records {
            print_trace(record);
        }
    }

    let percentiles = db.performance_percentiles(transaction.as_deref(), None).await?;
    if percentiles.count > 0 {
        println!();
        println!(
            "{} {} traces, p50 {} p95 {} p99 {}",
            "Durations:".bold(),
            percentiles.count,
            format_ms(percentiles.p50),
            format_ms(percentiles.p95),
            format_ms(percentiles.p99),
        );
    }

    Ok(())
}

fn print_trace(record: &PerformanceRecord) {
    println!(
        "{} {} {} {}",
        record.captured_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        record.transaction_type.as_str().blue(),
        record.transaction_name.cyan(),
        format!("{:.1}ms ({} queries, {:.1}ms db)", record.duration_ms, record.query_count, record.db_duration_ms)
    );

    for pattern in &record.n_plus_one_patterns {
        println!(
            "    {} {}x {:.1}ms {}",
            "N+1".red().bold(),
            pattern.count,
            pattern.total_duration_ms,
            pattern.pattern
        );
    }

    for query in &record.slow_queries {
        println!("    {} {:.1}ms {}", "slow".yellow().bold(), query.duration_ms, query.sql);
    }
}

fn format_ms(value: Option<f64>) -> String {
    value.map(|v| format!("{:.1}ms", v)).unwrap_or_else(|| "-".to_string())
}
