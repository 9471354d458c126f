use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "faultline", version, about = "Error and performance telemetry pipeline")]
pub struct Cli {
    /// Configuration file path (defaults to ./faultline.toml when present)
    #[arg(short, long, global = true, env = "FAULTLINE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the persister and retention cleanup until interrupted (default)
    Run,

    /// Capture newline-delimited JSON events from a file or stdin, then flush
    Ingest {
        /// Input file; reads stdin when omitted or "-"
        file: Option<PathBuf>,
    },

    /// List aggregated errors
    Errors {
        /// Filter by status: unresolved, resolved, ignored
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by severity: debug, info, warning, error, fatal
        #[arg(long)]
        severity: Option<String>,

        /// Only errors seen within the last N hours
        #[arg(long)]
        since_hours: Option<u64>,

        /// Maximum number of rows
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one error in detail
    Show {
        fingerprint: String,
    },

    /// Mark an error resolved; it reopens if it recurs
    Resolve {
        fingerprint: String,
    },

    /// Ignore an error; it stays ignored when it recurs
    Ignore {
        fingerprint: String,
    },

    /// List recent traces flagged for N+1 or slow queries
    Slow {
        /// Only this transaction
        #[arg(short, long)]
        transaction: Option<String>,

        /// Maximum number of rows
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run retention cleanup now
    Cleanup,

    /// Show database statistics
    Stats,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration (with secrets masked)
    Show,

    /// Validate configuration
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Run if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}
