//! Implementation of the `keg info` command.

use std::path::Path;

use anyhow::Result;

use crate::output::OutputFormat;

/// Print formula metadata.
pub fn cmd_info(formula_path: &Path, format: OutputFormat) -> Result<()> {
  let formula = super::load_formula(formula_path);

  if format.is_json() {
    println!("{}", serde_json::to_string_pretty(&formula)?);
    return Ok(());
  }

  println!("{} {}", formula.name, formula.version);
  println!("  {}", formula.description);
  println!("  Homepage:  {}", formula.homepage);
  println!("  License:   {}", formula.license);
  println!("  Source:    {}", formula.source.url);

  if !formula.build_dependencies.is_empty() {
    println!("  Build deps: {}", formula.build_dependencies.join(", "));
  }

  if !formula.resources.is_empty() {
    println!("  Resources:");
    for resource in &formula.resources {
      println!("    {} {}", resource.name, resource.url);
    }
  }

  Ok(())
}
