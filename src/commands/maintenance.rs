use anyhow::Result;
use colored::Colorize;
use faultline::clock::SystemClock;
use faultline::storage::{run_cleanup_now, TelemetryDb};
use faultline::Config;

/// Execute the cleanup command
pub async fn cleanup(cfg: &Config) -> Result<()> {
    println!(
        "{}",
        format!("Removing data older than {} days...", cfg.retention_days).yellow()
    );

    let db = TelemetryDb::connect(&cfg.database_url).await?;
    let stats = run_cleanup_now(&db, cfg.retention_days, &SystemClock).await?;

    println!("{}", "✓ Cleanup completed".green());
    println!("  Performance traces deleted: {}", stats.performance_deleted);
    println!("  Closed errors deleted: {}", stats.errors_deleted);
    Ok(())
}

/// Execute the stats command
pub async fn stats(cfg: &Config) -> Result<()> {
    let db = TelemetryDb::connect(&cfg.database_url).await?;
    let stats = db.get_stats().await?;

    println!("{}", "Database Statistics:".bold());
    println!("  Database: {}", cfg.database_url);
    println!("  Error groups: {}", stats.error_count);
    println!("  Unresolved: {}", stats.unresolved_count.to_string().red());
    println!("  Total occurrences: {}", stats.occurrence_total);
    println!("  Performance traces: {}", stats.performance_count);
    println!("  Buffered (sqlite backend): {}", stats.buffered_count);
    Ok(())
}
