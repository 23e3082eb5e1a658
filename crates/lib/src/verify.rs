//! Post-install smoke test.
//!
//! The acceptance gate for a build: the formula's minimal consumer program is
//! compiled against the installed headers, linked against the installed
//! library, and executed. An install whose interface cannot be consumed this
//! way is a failed build regardless of what the toolchain reported.

use std::path::Path;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::executor::Toolchain;
use crate::formula::TestSpec;

/// Which phase of the smoke test failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
  Compile,
  Run,
}

impl std::fmt::Display for VerifyPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      VerifyPhase::Compile => "compile",
      VerifyPhase::Run => "run",
    })
  }
}

/// Errors from the post-install verification.
#[derive(Debug, Error)]
pub enum VerifyError {
  #[error("smoke test {phase} failed with exit code {code:?}")]
  Phase {
    phase: VerifyPhase,
    code: Option<i32>,
    stdout: String,
    stderr: String,
  },

  #[error("failed to launch smoke test {phase} ({program}): {source}")]
  Spawn {
    phase: VerifyPhase,
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Compile and run the formula's consumer program against `prefix`.
///
/// The program is written into a scratch temp directory, compiled with the
/// explicit C compiler using the prefix's `include` and `lib` paths, and run
/// with the prefix's `lib` directory on the loader path so a freshly
/// installed shared library resolves without a system-wide ldconfig.
pub async fn verify_install(prefix: &Path, test: &TestSpec, toolchain: &Toolchain) -> Result<(), VerifyError> {
  let scratch = tempfile::Builder::new().prefix("keg-test-").tempdir()?;
  let source = scratch.path().join("main.c");
  let binary = scratch.path().join("consumer");

  tokio::fs::write(&source, &test.source).await?;

  let lib_dir = prefix.join("lib");
  info!(prefix = %prefix.display(), link = %test.link, "verifying installed artifact");

  let compile = Command::new(&toolchain.cc)
    .arg(&source)
    .arg(format!("-I{}", prefix.join("include").display()))
    .arg(format!("-L{}", lib_dir.display()))
    .arg(format!("-l{}", test.link))
    .arg("-o")
    .arg(&binary)
    .current_dir(scratch.path())
    .kill_on_drop(true)
    .output()
    .await
    .map_err(|source| VerifyError::Spawn {
      phase: VerifyPhase::Compile,
      program: toolchain.cc.clone(),
      source,
    })?;

  if !compile.status.success() {
    return Err(VerifyError::Phase {
      phase: VerifyPhase::Compile,
      code: compile.status.code(),
      stdout: String::from_utf8_lossy(&compile.stdout).to_string(),
      stderr: String::from_utf8_lossy(&compile.stderr).to_string(),
    });
  }

  debug!(binary = %binary.display(), "smoke test compiled");

  let run = Command::new(&binary)
    .current_dir(scratch.path())
    .env("LD_LIBRARY_PATH", &lib_dir)
    .env("DYLD_FALLBACK_LIBRARY_PATH", &lib_dir)
    .kill_on_drop(true)
    .output()
    .await
    .map_err(|source| VerifyError::Spawn {
      phase: VerifyPhase::Run,
      program: binary.display().to_string(),
      source,
    })?;

  if !run.status.success() {
    return Err(VerifyError::Phase {
      phase: VerifyPhase::Run,
      code: run.status.code(),
      stdout: String::from_utf8_lossy(&run.stdout).to_string(),
      stderr: String::from_utf8_lossy(&run.stderr).to_string(),
    });
  }

  info!(prefix = %prefix.display(), "installed artifact verified");
  Ok(())
}
