mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gantry_worker::PlacementChain;

#[derive(Parser)]
#[command(name = "gantry", version, about = "Build execution core for CI pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Worker placement strategy chain, comma separated
    /// (volume-locality, fewest-build-containers, limit-active-tasks,
    /// random)
    #[arg(long, default_value = "volume-locality", global = true)]
    placement_strategy: String,

    /// Task cap per worker for limit-active-tasks; 0 disables the cap
    #[arg(long, default_value_t = 0, global = true)]
    max_active_tasks_per_worker: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and compile a plan file, reporting malformed plans
    Validate {
        /// Path to a plan JSON file
        plan: PathBuf,
    },
    /// Print the compiled step tree of a plan file
    Explain {
        /// Path to a plan JSON file
        plan: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    // An invalid strategy chain is a startup error, not a per-step one.
    let mut placement = PlacementChain::parse(&cli.placement_strategy)
        .context("invalid --placement-strategy")?;
    placement.max_active_tasks = cli.max_active_tasks_per_worker;

    match cli.command {
        Commands::Validate { plan } => commands::validate::execute(&plan, placement),
        Commands::Explain { plan } => commands::explain::execute(&plan, placement),
    }
}
