//! Keel: Perforce sync and build orchestrator.
//!
//! # Usage
//!
//! ```text
//! keel run [--config <path>]
//! keel check [--config <path>] [--json]
//! keel status [--json]
//! keel stop
//! keel force <project>
//! keel logs [--lines <n>] [--project <name>]
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, daemon::LogsArgs, status::StatusArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "keel",
    version,
    about = "Detect upstream changes, sync one project at a time, build in parallel",
    long_about = None,
)]
struct Cli {
    /// Configuration file (defaults to ~/.keel/config.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator in the foreground.
    Run,

    /// Load and validate the configuration.
    Check(CheckArgs),

    /// Show per-project status from the running orchestrator.
    Status(StatusArgs),

    /// Ask the running orchestrator to shut down.
    Stop,

    /// Re-sync and rebuild a project on the next tick.
    Force {
        /// Project name as configured.
        project: String,
    },

    /// Print recent orchestrator or worker log lines.
    Logs(LogsArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run => commands::daemon::run(config),
        Commands::Check(args) => args.run(config),
        Commands::Status(args) => args.run(),
        Commands::Stop => commands::daemon::stop(),
        Commands::Force { project } => commands::daemon::force(&project),
        Commands::Logs(args) => args.run(config),
    }
}
