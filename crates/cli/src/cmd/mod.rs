mod build;
mod check;
mod info;

pub use build::{BuildArgs, cmd_build};
pub use check::cmd_check;
pub use info::cmd_info;

use std::path::Path;

use keg_lib::formula::Formula;

use crate::output;

/// Load a formula descriptor, printing the failure and exiting non-zero if
/// it cannot be read or does not validate.
pub(crate) fn load_formula(path: &Path) -> Formula {
  match Formula::from_path(path) {
    Ok(formula) => formula,
    Err(e) => {
      output::print_error(&format!("invalid formula {}: {}", path.display(), e));
      std::process::exit(1);
    }
  }
}
