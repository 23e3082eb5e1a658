//! Implementation of the `keg check` command.
//!
//! Validates a formula descriptor and prints the steps a build would run,
//! without fetching or executing anything. Formulas are data, so the whole
//! procedure can be inspected safely.

use std::path::Path;

use anyhow::Result;

use keg_lib::pipeline;

use crate::output::{self, OutputFormat};

/// Execute the check command.
pub fn cmd_check(formula_path: &Path, format: OutputFormat) -> Result<()> {
  let formula = super::load_formula(formula_path);

  let steps = match pipeline::plan(&formula) {
    Ok(steps) => steps,
    Err(e) => {
      output::print_error(&format!("invalid formula {}: {}", formula_path.display(), e));
      std::process::exit(1);
    }
  };

  if format.is_json() {
    println!("{}", serde_json::to_string_pretty(&steps)?);
    return Ok(());
  }

  output::print_info(&format!("{} {} would run {} steps:", formula.name, formula.version, steps.len()));
  for step in &steps {
    println!("  {:<12} {}", step.stage.as_str(), step.summary);
  }
  println!();
  output::print_success("formula is valid");

  Ok(())
}
