//! Kaji: command-line client for the team-state sync engine.
//!
//! # Usage
//!
//! ```text
//! kaji config show
//! kaji config init [--api-url <url>] [--origin <origin>] [--force]
//! kaji call <METHOD> <PATH> [--data <json>] [--if-match <token>] [--prime <path>]
//! kaji watch
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{call::CallArgs, config::ConfigCommand, watch::WatchArgs};

#[derive(Parser, Debug)]
#[command(
    name = "kaji",
    version,
    about = "Keep a household team's shared state in sync",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or create ~/.kaji/config.yaml.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Send one request through the conditional request client.
    Call(CallArgs),

    /// Follow the team's revision stream and log cache refreshes until ctrl-c.
    Watch(WatchArgs),
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Config { command } => commands::config::run(command),
        Commands::Call(args) => args.run(),
        Commands::Watch(args) => args.run(),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
