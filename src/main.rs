//! Stagecraft - Cache-Aware Build Graph Evaluator
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use stagecraft::cli::{Cli, Commands};
use stagecraft::config::ConfigManager;
use stagecraft::error::StagecraftResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StagecraftResult<()> {
    let cli = Cli::parse();

    // Initialize logging: 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("stagecraft=warn"),
        1 => EnvFilter::new("stagecraft=info"),
        _ => EnvFilter::new("stagecraft=debug"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    match cli.command {
        Commands::Build(args) => stagecraft::cli::commands::build(args, config).await,
        Commands::Plan(args) => stagecraft::cli::commands::plan(args).await,
        Commands::Graph(args) => stagecraft::cli::commands::graph(args).await,
    }
}
