use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use faultline::{init_tracing, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Configuration errors must stop startup before anything is wired up
    let cfg = load_config(args.config.as_deref())?;

    init_tracing(cfg.log_format);

    match args.get_command() {
        cli::Commands::Run => commands::run::execute(cfg).await?,
        cli::Commands::Ingest { file } => commands::ingest::execute(cfg, file).await?,
        cli::Commands::Errors {
            status,
            severity,
            since_hours,
            limit,
        } => commands::errors::list(&cfg, status, severity, since_hours, limit).await?,
        cli::Commands::Show { fingerprint } => commands::errors::show(&cfg, &fingerprint).await?,
        cli::Commands::Resolve { fingerprint } => {
            commands::errors::set_status(&cfg, &fingerprint, faultline::storage::ErrorStatus::Resolved).await?
        }
        cli::Commands::Ignore { fingerprint } => {
            commands::errors::set_status(&cfg, &fingerprint, faultline::storage::ErrorStatus::Ignored).await?
        }
        cli::Commands::Slow { transaction, limit } => commands::slow::execute(&cfg, transaction, limit).await?,
        cli::Commands::Cleanup => commands::maintenance::cleanup(&cfg).await?,
        cli::Commands::Stats => commands::maintenance::stats(&cfg).await?,
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&cfg)?,
            cli::ConfigCommands::Validate => commands::config::validate(&cfg)?,
        },
    }

    Ok(())
}
