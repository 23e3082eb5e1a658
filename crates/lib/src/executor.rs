//! Scoped toolchain invocation.
//!
//! The configure, compile, and install steps are separate child processes run
//! in order inside a build subdirectory, each with both output streams
//! captured. The first non-zero exit aborts the remaining steps; toolchain
//! failures are deterministic for fixed inputs, so nothing is retried.
//!
//! The toolchain binaries are an explicit [`Toolchain`] value supplied by the
//! caller, never read from ambient global state, so a build is reproducible
//! from its declared inputs alone. Children are spawned with `kill_on_drop`
//! so cancelling the pipeline terminates any in-flight step.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Which phase of the toolchain an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainStep {
  Configure,
  Compile,
  Install,
}

impl ToolchainStep {
  pub fn as_str(&self) -> &'static str {
    match self {
      ToolchainStep::Configure => "configure",
      ToolchainStep::Compile => "compile",
      ToolchainStep::Install => "install",
    }
  }
}

impl std::fmt::Display for ToolchainStep {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Errors from running the toolchain.
#[derive(Debug, Error)]
pub enum ToolchainError {
  /// A step exited non-zero. Carries both captured streams so the failure
  /// can be diagnosed without re-running with extra instrumentation.
  #[error("{step} step failed with exit code {code:?}")]
  StepFailed {
    step: ToolchainStep,
    code: Option<i32>,
    stdout: String,
    stderr: String,
  },

  /// A step's binary could not be launched at all.
  #[error("failed to launch {step} step ({program}): {source}")]
  Spawn {
    step: ToolchainStep,
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl ToolchainError {
  /// The step the error belongs to, where one is known.
  pub fn step(&self) -> Option<ToolchainStep> {
    match self {
      ToolchainError::StepFailed { step, .. } | ToolchainError::Spawn { step, .. } => Some(*step),
      ToolchainError::Io(_) => None,
    }
  }
}

/// Explicit toolchain configuration.
///
/// Passed in rather than discovered from the environment; the defaults name
/// the conventional binaries and resolve through `PATH` at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolchain {
  pub cmake: String,
  pub make: String,
  pub cc: String,
}

impl Default for Toolchain {
  fn default() -> Self {
    Self {
      cmake: "cmake".to_string(),
      make: "make".to_string(),
      cc: "cc".to_string(),
    }
  }
}

/// One toolchain step to run.
#[derive(Debug, Clone)]
pub struct ToolchainInvocation {
  pub step: ToolchainStep,
  pub program: String,
  pub args: Vec<String>,
  /// Environment overrides applied on top of the inherited environment.
  pub env: BTreeMap<String, String>,
}

/// Captured result of one completed step.
#[derive(Debug, Clone)]
pub struct StepOutput {
  pub step: ToolchainStep,
  pub stdout: String,
  pub stderr: String,
  pub elapsed: Duration,
}

/// The standard configure/compile/install sequence for a cmake-style
/// toolchain.
///
/// The configure step reads the synthesized descriptor in `descriptor_dir`,
/// receives the installation prefix, and passes any externally supplied
/// standard arguments through unmodified. The compiler choice is made
/// explicit to the configure step via `CC`.
pub fn standard_invocations(
  toolchain: &Toolchain,
  descriptor_dir: &Path,
  prefix: &Path,
  std_args: &[String],
) -> Vec<ToolchainInvocation> {
  let mut configure_args = vec![
    descriptor_dir.display().to_string(),
    format!("-DCMAKE_INSTALL_PREFIX={}", prefix.display()),
  ];
  configure_args.extend(std_args.iter().cloned());

  let mut configure_env = BTreeMap::new();
  configure_env.insert("CC".to_string(), toolchain.cc.clone());

  vec![
    ToolchainInvocation {
      step: ToolchainStep::Configure,
      program: toolchain.cmake.clone(),
      args: configure_args,
      env: configure_env,
    },
    ToolchainInvocation {
      step: ToolchainStep::Compile,
      program: toolchain.make.clone(),
      args: vec![],
      env: BTreeMap::new(),
    },
    ToolchainInvocation {
      step: ToolchainStep::Install,
      program: toolchain.make.clone(),
      args: vec!["install".to_string()],
      env: BTreeMap::new(),
    },
  ]
}

/// Create `build_dir` and run the invocations in order inside it.
///
/// Stops at the first failure; later steps do not run. Returns the captured
/// output of every completed step.
pub async fn run_toolchain(
  build_dir: &Path,
  invocations: Vec<ToolchainInvocation>,
) -> Result<Vec<StepOutput>, ToolchainError> {
  tokio::fs::create_dir_all(build_dir).await?;

  let mut outputs = Vec::with_capacity(invocations.len());

  for invocation in invocations {
    info!(
      step = %invocation.step,
      program = %invocation.program,
      dir = %build_dir.display(),
      "running toolchain step"
    );

    let started = Instant::now();
    let output = Command::new(&invocation.program)
      .args(&invocation.args)
      .envs(&invocation.env)
      .current_dir(build_dir)
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|source| ToolchainError::Spawn {
        step: invocation.step,
        program: invocation.program.clone(),
        source,
      })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
      return Err(ToolchainError::StepFailed {
        step: invocation.step,
        code: output.status.code(),
        stdout,
        stderr,
      });
    }

    debug!(step = %invocation.step, elapsed = ?started.elapsed(), "step complete");
    outputs.push(StepOutput {
      step: invocation.step,
      stdout,
      stderr,
      elapsed: started.elapsed(),
    });
  }

  Ok(outputs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;
  use tempfile::TempDir;

  /// Write an executable shell script into `dir` and return its path.
  #[cfg(unix)]
  fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  fn invocation(step: ToolchainStep, program: &Path) -> ToolchainInvocation {
    ToolchainInvocation {
      step,
      program: program.display().to_string(),
      args: vec![],
      env: BTreeMap::new(),
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn runs_steps_in_order() {
    let temp = TempDir::new().unwrap();
    let build_dir = temp.path().join("build");

    let configure = write_script(temp.path(), "configure.sh", "echo configured; touch configured");
    let compile = write_script(temp.path(), "compile.sh", "test -f configured && touch compiled");
    let install = write_script(temp.path(), "install.sh", "test -f compiled && touch installed");

    let outputs = run_toolchain(
      &build_dir,
      vec![
        invocation(ToolchainStep::Configure, &configure),
        invocation(ToolchainStep::Compile, &compile),
        invocation(ToolchainStep::Install, &install),
      ],
    )
    .await
    .unwrap();

    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0].stdout.trim(), "configured");
    assert!(build_dir.join("installed").exists());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn halts_after_first_failure() {
    let temp = TempDir::new().unwrap();
    let build_dir = temp.path().join("build");

    let configure = write_script(temp.path(), "configure.sh", "touch configured");
    let compile = write_script(temp.path(), "compile.sh", "echo broken >&2; exit 2");
    let install = write_script(temp.path(), "install.sh", "touch installed");

    let err = run_toolchain(
      &build_dir,
      vec![
        invocation(ToolchainStep::Configure, &configure),
        invocation(ToolchainStep::Compile, &compile),
        invocation(ToolchainStep::Install, &install),
      ],
    )
    .await
    .unwrap_err();

    match err {
      ToolchainError::StepFailed { step, code, stderr, .. } => {
        assert_eq!(step, ToolchainStep::Compile);
        assert_eq!(code, Some(2));
        assert_eq!(stderr.trim(), "broken");
      }
      other => panic!("expected step failure, got {other:?}"),
    }

    // The install step must not have run.
    assert!(build_dir.join("configured").exists());
    assert!(!build_dir.join("installed").exists());
  }

  #[tokio::test]
  async fn missing_binary_is_a_spawn_error() {
    let temp = TempDir::new().unwrap();
    let build_dir = temp.path().join("build");

    let err = run_toolchain(
      &build_dir,
      vec![ToolchainInvocation {
        step: ToolchainStep::Configure,
        program: temp.path().join("does-not-exist").display().to_string(),
        args: vec![],
        env: BTreeMap::new(),
      }],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ToolchainError::Spawn { step: ToolchainStep::Configure, .. }));
  }

  #[test]
  fn standard_invocations_pass_args_through() {
    let toolchain = Toolchain::default();
    let invocations = standard_invocations(
      &toolchain,
      Path::new("/tree/build_shared"),
      Path::new("/opt/pkg"),
      &["-DCMAKE_BUILD_TYPE=Release".to_string()],
    );

    assert_eq!(invocations.len(), 3);
    assert_eq!(invocations[0].step, ToolchainStep::Configure);
    assert_eq!(
      invocations[0].args,
      vec![
        "/tree/build_shared".to_string(),
        "-DCMAKE_INSTALL_PREFIX=/opt/pkg".to_string(),
        "-DCMAKE_BUILD_TYPE=Release".to_string(),
      ]
    );
    assert_eq!(invocations[0].env.get("CC"), Some(&"cc".to_string()));
    assert_eq!(invocations[1].args, Vec::<String>::new());
    assert_eq!(invocations[2].args, vec!["install".to_string()]);
  }
}
