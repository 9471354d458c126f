use anyhow::Result;
use colored::Colorize;
use faultline::signals::shutdown_signal;
use faultline::{Config, Telemetry};
use tracing::{info, warn};

/// Execute the run command
///
/// Starts the persister and retention task, then blocks until SIGTERM or
/// SIGINT. Shutdown stops the loop and drains what is left within the
/// configured grace period.
pub async fn execute(cfg: Config) -> Result<()> {
    println!("{}", "Starting faultline pipeline...".green());
    println!("  Database: {}", cfg.database_url);
    println!("  Buffer: {:?} (max {} per queue)", cfg.buffer_backend, cfg.buffer_max_size);
    println!("  Persist interval: {}s", cfg.persist_interval_seconds);

    let telemetry = Telemetry::builder(cfg).build().await?;
    telemetry.start();

    info!("Pipeline running, waiting for shutdown signal");
    shutdown_signal().await;

    println!("{}", "Shutting down, draining buffered events...".yellow());
    let clean = telemetry.stop().await;
    if !clean {
        warn!("Shutdown grace period exceeded, some buffered events were left behind");
    }

    let stats = telemetry.stats().await;
    println!();
    println!("{}", "Final pipeline state:".bold());
    println!("  Error queue: {}", stats.error_queue_len);
    println!("  Performance queue: {}", stats.performance_queue_len);
    println!("  Circuit: {:?}", stats.circuit_state);
    println!(
        "  Dropped: {} circuit open, {} overflow, {} expired",
        stats.dropped_circuit_open, stats.dropped_overflow, stats.dropped_expired
    );

    if clean {
        println!("{}", "✓ Shutdown complete".green());
    } else {
        println!("{}", "⚠ Shutdown timed out before the buffer was drained".yellow());
    }

    Ok(())
}
