//! Implementation of the `keg build` command.
//!
//! Runs the full pipeline for one formula: fetch and verify every declared
//! archive, stage them into a fresh build tree, synthesize the build
//! descriptor, drive configure/compile/install, and smoke-test the installed
//! artifact. Exits 0 only when every stage through verification succeeds.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use keg_lib::pipeline::{self, BuildConfig, BuildError, BuildReport};

use crate::output::{self, OutputFormat, format_duration};

#[derive(Args)]
pub struct BuildArgs {
  /// Path to the formula descriptor (TOML)
  pub formula: PathBuf,

  /// Installation prefix to install into
  #[arg(long)]
  pub prefix: PathBuf,

  /// Standard build arguments passed through to the configure step unmodified
  #[arg(long = "std-arg", value_name = "ARG")]
  pub std_args: Vec<String>,

  /// Configure/generate binary
  #[arg(long, default_value = "cmake")]
  pub cmake: String,

  /// Compile/install binary
  #[arg(long, default_value = "make")]
  pub make: String,

  /// C compiler, used by the configure step and the smoke test
  #[arg(long, default_value = "cc")]
  pub cc: String,

  /// Download cache directory (defaults to the per-user cache)
  #[arg(long, value_name = "DIR")]
  pub cache_dir: Option<PathBuf>,
}

enum Outcome {
  Done(std::result::Result<BuildReport, pipeline::PipelineError>),
  Cancelled,
}

/// Execute the build command.
pub fn cmd_build(args: &BuildArgs, format: OutputFormat) -> Result<()> {
  let formula = super::load_formula(&args.formula);

  let mut config = BuildConfig::new(&args.prefix);
  config.std_args = args.std_args.clone();
  config.toolchain.cmake = args.cmake.clone();
  config.toolchain.make = args.make.clone();
  config.toolchain.cc = args.cc.clone();
  if let Some(dir) = &args.cache_dir {
    config.cache_dir = dir.clone();
  }

  info!(formula = %formula.name, prefix = %args.prefix.display(), "starting build");

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let outcome = rt.block_on(async {
    tokio::select! {
      result = pipeline::build_formula(&formula, &config) => Outcome::Done(result),
      // Dropping the pipeline future kills any in-flight toolchain step and
      // removes the build tree.
      _ = tokio::signal::ctrl_c() => Outcome::Cancelled,
    }
  });

  match outcome {
    Outcome::Done(Ok(report)) => {
      if format.is_json() {
        println!("{}", serde_json::to_string_pretty(&report)?);
      } else {
        print_report(&report);
      }
      Ok(())
    }
    Outcome::Done(Err(e)) => {
      output::print_error(&format!("{e}"));
      std::process::exit(1);
    }
    Outcome::Cancelled => {
      output::print_warning(&format!("{}, build tree removed", BuildError::Cancelled));
      std::process::exit(130);
    }
  }
}

fn print_report(report: &BuildReport) {
  println!();
  output::print_success(&format!(
    "installed {} {} (compatibility version {}) to {}",
    report.name,
    report.version,
    report.soversion,
    report.prefix.display()
  ));

  for timing in &report.stages {
    println!("  {:<12} {}", timing.stage.as_str(), format_duration(timing.elapsed));
  }
  println!("  {:<12} {}", "total", format_duration(report.total));
}
