//! The single-package build pipeline.
//!
//! Stages run strictly in order, one direction, no cycles:
//!
//! ```text
//! Fetching → Staging → Synthesizing → Configuring → Compiling → Installing → Verifying
//! ```
//!
//! Each stage's success is a precondition for the next; the first failure
//! aborts the remainder and surfaces as [`PipelineError`] naming the failing
//! stage. Nothing after Fetching begins until every declared digest has
//! verified. The build tree is torn down on every exit path; partially
//! installed files under the prefix are not rolled back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use semver::Version;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::cache::DownloadCache;
use crate::descriptor::{self, TemplateError};
use crate::executor::{self, Toolchain, ToolchainError, ToolchainStep};
use crate::fetch::{self, FetchError};
use crate::formula::{Formula, FormulaError, InstallStep};
use crate::tree::with_build_tree;
use crate::verify::{self, VerifyError};

/// A stage of the build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Fetching,
  Staging,
  Synthesizing,
  Configuring,
  Compiling,
  Installing,
  Verifying,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Fetching => "fetching",
      Stage::Staging => "staging",
      Stage::Synthesizing => "synthesizing",
      Stage::Configuring => "configuring",
      Stage::Compiling => "compiling",
      Stage::Installing => "installing",
      Stage::Verifying => "verifying",
    }
  }
}

impl std::fmt::Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The underlying cause of a pipeline failure.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Formula(#[from] FormulaError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error(transparent)]
  Verify(#[from] VerifyError),

  /// The build was interrupted. The build tree is still torn down.
  #[error("build cancelled")]
  Cancelled,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// A pipeline failure, naming the stage it happened in.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct PipelineError {
  pub stage: Stage,
  #[source]
  pub source: BuildError,
}

// Build-tree creation is the first act of staging.
impl From<std::io::Error> for PipelineError {
  fn from(e: std::io::Error) -> Self {
    fail(Stage::Staging, e)
  }
}

fn fail(stage: Stage, source: impl Into<BuildError>) -> PipelineError {
  PipelineError {
    stage,
    source: source.into(),
  }
}

/// Configuration for one build invocation.
///
/// Everything a build depends on is in here or in the formula; nothing is
/// read from ambient global state.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Installation prefix the toolchain installs into and the verifier
  /// consumes from.
  pub prefix: PathBuf,
  /// Externally supplied standard build arguments, passed through to the
  /// configure step unmodified.
  pub std_args: Vec<String>,
  pub toolchain: Toolchain,
  /// Directory of the shared download cache.
  pub cache_dir: PathBuf,
}

impl BuildConfig {
  pub fn new(prefix: impl Into<PathBuf>) -> Self {
    Self {
      prefix: prefix.into(),
      std_args: Vec::new(),
      toolchain: Toolchain::default(),
      cache_dir: DownloadCache::default_dir(),
    }
  }
}

/// Wall-clock spent in one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
  pub stage: Stage,
  pub elapsed: Duration,
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
  pub name: String,
  pub version: String,
  pub soversion: u64,
  pub prefix: PathBuf,
  pub stages: Vec<StageTiming>,
  pub total: Duration,
}

/// One entry of a dry-run plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
  pub stage: Stage,
  pub summary: String,
}

/// Run the full build pipeline for one formula.
///
/// Fetches and verifies the source and every declared resource, stages them
/// into a fresh build tree, synthesizes the build descriptor, drives the
/// configure/compile/install toolchain, and finally compiles and runs the
/// smoke test against the installed prefix. The build tree lives exactly as
/// long as this future: completing, failing, or dropping it (cancellation)
/// removes the tree.
pub async fn build_formula(formula: &Formula, config: &BuildConfig) -> Result<BuildReport, PipelineError> {
  formula.validate().map_err(|e| fail(Stage::Fetching, e))?;
  let version = formula.parsed_version().map_err(|e| fail(Stage::Fetching, e))?;

  let cache = DownloadCache::new(&config.cache_dir);
  let started = Instant::now();

  info!(name = %formula.name, version = %formula.version, "starting build");

  with_build_tree(|root| async move {
    let mut timings: Vec<StageTiming> = Vec::new();

    // Fetching: every declared digest must verify before anything is staged.
    let fetch_started = Instant::now();
    let source_archive = fetch::fetch_archive(&formula.source.url, &formula.source.sha256, &cache)
      .await
      .map_err(|e| fail(Stage::Fetching, e))?;

    let mut resource_archives: BTreeMap<String, PathBuf> = BTreeMap::new();
    for resource in &formula.resources {
      let path = fetch::fetch_archive(&resource.url, &resource.sha256, &cache)
        .await
        .map_err(|e| fail(Stage::Fetching, e))?;
      resource_archives.insert(resource.name.clone(), path);
    }
    add_timing(&mut timings, Stage::Fetching, fetch_started.elapsed());

    // Staging: the source archive populates the build tree root.
    let stage_started = Instant::now();
    fetch::stage_archive(&source_archive, &root).map_err(|e| fail(Stage::Staging, e))?;
    add_timing(&mut timings, Stage::Staging, stage_started.elapsed());

    let mut staged: BTreeMap<String, PathBuf> = BTreeMap::new();

    for step in &formula.install {
      match step {
        InstallStep::Stage { resource, dest } => {
          let archive = resource_archives
            .get(resource)
            .ok_or_else(|| fail(Stage::Staging, FormulaError::UnknownResource(resource.clone())))?;
          let dest_path = root.join(dest);

          info!(resource = %resource, dest = %dest_path.display(), "staging resource");
          let step_started = Instant::now();
          fetch::stage_archive(archive, &dest_path).map_err(|e| fail(Stage::Staging, e))?;
          add_timing(&mut timings, Stage::Staging, step_started.elapsed());

          staged.insert(resource.clone(), dest_path);
        }

        InstallStep::Render { dest, template } => {
          let step_started = Instant::now();
          let dest_path = root.join(dest);
          let bindings = descriptor_bindings(&version, &root, &config.prefix, &staged);

          // Rendering resolves every binding before anything is written.
          let document = descriptor::render(template, &bindings).map_err(|e| fail(Stage::Synthesizing, e))?;

          if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
              .await
              .map_err(|e| fail(Stage::Synthesizing, e))?;
          }
          tokio::fs::write(&dest_path, document)
            .await
            .map_err(|e| fail(Stage::Synthesizing, e))?;

          info!(dest = %dest_path.display(), "synthesized build descriptor");
          add_timing(&mut timings, Stage::Synthesizing, step_started.elapsed());
        }

        InstallStep::Build { subdir, descriptor_dir } => {
          let build_dir = root.join(subdir);
          let descriptor_path = root.join(descriptor_dir);
          let invocations =
            executor::standard_invocations(&config.toolchain, &descriptor_path, &config.prefix, &config.std_args);

          let outputs = executor::run_toolchain(&build_dir, invocations)
            .await
            .map_err(|e| fail(toolchain_stage(&e), e))?;

          for output in outputs {
            add_timing(&mut timings, toolchain_step_stage(output.step), output.elapsed);
          }
        }
      }
    }

    // Verifying: the acceptance gate.
    let verify_started = Instant::now();
    verify::verify_install(&config.prefix, &formula.test, &config.toolchain)
      .await
      .map_err(|e| fail(Stage::Verifying, e))?;
    add_timing(&mut timings, Stage::Verifying, verify_started.elapsed());

    info!(name = %formula.name, prefix = %config.prefix.display(), "build complete");

    Ok(BuildReport {
      name: formula.name.clone(),
      version: formula.version.clone(),
      soversion: version.major,
      prefix: config.prefix.clone(),
      stages: timings,
      total: started.elapsed(),
    })
  })
  .await
}

/// Describe what a build would do, without executing anything.
///
/// Validates the formula and expands its steps into the stages they would
/// run under. This is the dry-run surface: formulas are data, so the whole
/// procedure can be inspected safely.
pub fn plan(formula: &Formula) -> Result<Vec<PlannedStep>, FormulaError> {
  formula.validate()?;

  let mut steps = vec![PlannedStep {
    stage: Stage::Fetching,
    summary: format!("fetch and verify source {}", formula.source.url),
  }];

  for resource in &formula.resources {
    steps.push(PlannedStep {
      stage: Stage::Fetching,
      summary: format!("fetch and verify resource '{}' from {}", resource.name, resource.url),
    });
  }

  steps.push(PlannedStep {
    stage: Stage::Staging,
    summary: "stage source into a fresh build tree".to_string(),
  });

  for step in &formula.install {
    match step {
      InstallStep::Stage { resource, dest } => steps.push(PlannedStep {
        stage: Stage::Staging,
        summary: format!("stage resource '{resource}' at {dest}"),
      }),
      InstallStep::Render { dest, .. } => steps.push(PlannedStep {
        stage: Stage::Synthesizing,
        summary: format!("render build descriptor to {dest}"),
      }),
      InstallStep::Build { subdir, descriptor_dir } => {
        steps.push(PlannedStep {
          stage: Stage::Configuring,
          summary: format!("configure in {subdir} from descriptor in {descriptor_dir}"),
        });
        steps.push(PlannedStep {
          stage: Stage::Compiling,
          summary: format!("compile in {subdir}"),
        });
        steps.push(PlannedStep {
          stage: Stage::Installing,
          summary: format!("install from {subdir} into the prefix"),
        });
      }
    }
  }

  steps.push(PlannedStep {
    stage: Stage::Verifying,
    summary: format!("compile and run the smoke test (links -l{})", formula.test.link),
  });

  Ok(steps)
}

/// Bindings available to descriptor templates: the declared version, its
/// major component, the tree and prefix roots, and the absolute staged path
/// of every resource staged so far.
fn descriptor_bindings(
  version: &Version,
  root: &Path,
  prefix: &Path,
  staged: &BTreeMap<String, PathBuf>,
) -> BTreeMap<String, String> {
  let mut bindings = BTreeMap::new();
  bindings.insert("version".to_string(), version.to_string());
  bindings.insert("soversion".to_string(), version.major.to_string());
  bindings.insert("source_dir".to_string(), root.display().to_string());
  bindings.insert("prefix".to_string(), prefix.display().to_string());
  for (name, path) in staged {
    bindings.insert(format!("resource.{name}"), path.display().to_string());
  }
  bindings
}

fn toolchain_step_stage(step: ToolchainStep) -> Stage {
  match step {
    ToolchainStep::Configure => Stage::Configuring,
    ToolchainStep::Compile => Stage::Compiling,
    ToolchainStep::Install => Stage::Installing,
  }
}

fn toolchain_stage(e: &ToolchainError) -> Stage {
  // Build-dir creation happens before the configure step launches.
  e.step().map(toolchain_step_stage).unwrap_or(Stage::Configuring)
}

fn add_timing(timings: &mut Vec<StageTiming>, stage: Stage, elapsed: Duration) {
  if let Some(last) = timings.last_mut()
    && last.stage == stage
  {
    last.elapsed += elapsed;
    return;
  }
  timings.push(StageTiming { stage, elapsed });
}
