use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

use output::OutputFormat;

/// keg - declarative single-package build orchestrator
#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Output format for reports
  #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  format: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch, stage, build, install, and verify a formula
  Build(cmd::BuildArgs),

  /// Validate a formula and show the steps a build would run
  Check {
    /// Path to the formula descriptor (TOML)
    formula: PathBuf,
  },

  /// Show formula metadata
  Info {
    /// Path to the formula descriptor (TOML)
    formula: PathBuf,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();

  match cli.command {
    Commands::Build(args) => cmd::cmd_build(&args, cli.format),
    Commands::Check { formula } => cmd::cmd_check(&formula, cli.format),
    Commands::Info { formula } => cmd::cmd_info(&formula, cli.format),
  }
}
