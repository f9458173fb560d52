//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Stagecraft - Cache-aware build graph evaluator
///
/// Evaluates a multi-stage build document into a parallel, cache-aware
/// execution plan and composes final artifact sets from selected stages.
#[derive(Parser, Debug)]
#[command(name = "stagecraft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STAGECRAFT_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a build document
    Build(BuildArgs),

    /// Show the execution plan without running anything
    Plan(PlanArgs),

    /// Print the resolved dependency graph
    Graph(GraphArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Stage document (JSON)
    #[arg(short = 'f', long = "file", default_value = "stages.json")]
    pub file: PathBuf,

    /// Target stage(s); defaults to the document's declared targets
    #[arg(short, long)]
    pub target: Vec<String>,

    /// Build argument override (repeatable)
    #[arg(short = 'a', long = "arg", value_name = "NAME=VALUE")]
    pub args: Vec<String>,

    /// Concurrency limit for stage execution
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Directory to write composed target outputs into
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Cache directory (defaults to the user cache dir)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Emit the build report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Stage document (JSON)
    #[arg(short = 'f', long = "file", default_value = "stages.json")]
    pub file: PathBuf,

    /// Target stage(s); defaults to the document's declared targets
    #[arg(short, long)]
    pub target: Vec<String>,

    /// Build argument override (repeatable)
    #[arg(short = 'a', long = "arg", value_name = "NAME=VALUE")]
    pub args: Vec<String>,

    /// Cache directory (defaults to the user cache dir)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Arguments for the graph command
#[derive(Parser, Debug)]
pub struct GraphArgs {
    /// Stage document (JSON)
    #[arg(short = 'f', long = "file", default_value = "stages.json")]
    pub file: PathBuf,
}
