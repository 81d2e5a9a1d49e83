//! GridBench CLI
//!
//! One binary for every role of a multi-process deployment:
//!
//! ```text
//!   gridbench coordinator --agent host:9001 --agent host:9002 --suite tests.toml
//!        │ TCP
//!   gridbench agent --index 1 --listen 0.0.0.0:9001
//!        │ spawns + TCP
//!   gridbench worker --address A1_W1 --listen 127.0.0.1:0
//! ```

mod commands;
mod suite;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// GridBench distributed benchmark driver
#[derive(Parser, Debug)]
#[command(name = "gridbench")]
#[command(about = "Drive distributed benchmark tests across agents and workers", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to agents, start workers and run tests
    Coordinator(commands::CoordinatorArgs),

    /// Serve the coordinator and spawn worker processes
    Agent(commands::AgentArgs),

    /// Run tests on behalf of an agent (started by the agent)
    Worker(commands::WorkerArgs),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout is reserved for the worker handshake and JSON results
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = gridbench_core::GridConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Command::Coordinator(args) => commands::run_coordinator(config, args).await,
        Command::Agent(args) => commands::run_agent(config, args).await,
        Command::Worker(args) => commands::run_worker(config, args).await,
    }
}
