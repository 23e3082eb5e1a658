//! Formula descriptors.
//!
//! A formula is the immutable description of one buildable package: metadata,
//! a checksummed source archive, zero or more checksummed auxiliary
//! resources, an ordered list of typed install steps, and a post-install
//! smoke test. Formulas are data, with no embedded code to execute, so
//! a formula can be validated and dry-run without running anything.
//!
//! Descriptors are deserialized from TOML and validated once at load; a
//! `Formula` is never mutated after construction.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{self, TemplateError};

/// The immutable descriptor of one buildable package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Formula {
  pub name: String,
  pub description: String,
  pub homepage: String,
  /// Full version of the package, e.g. `3.1.5`. The compatibility (ABI)
  /// version of the installed artifact is always its major component.
  pub version: String,
  pub license: String,
  pub source: SourceSpec,
  /// Tools required only during the build, never at runtime.
  #[serde(default)]
  pub build_dependencies: Vec<String>,
  #[serde(default)]
  pub resources: Vec<Resource>,
  pub install: Vec<InstallStep>,
  pub test: TestSpec,
}

/// The primary source archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
  pub url: String,
  pub sha256: String,
}

/// A named auxiliary archive staged into the build tree before building.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resource {
  pub name: String,
  pub url: String,
  pub sha256: String,
}

/// One step of the install procedure. Paths are relative to the build tree
/// root and may not escape it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallStep {
  /// Stage a verified resource's content at `dest`.
  Stage { resource: String, dest: String },

  /// Render the build descriptor template to `dest`.
  Render { dest: String, template: String },

  /// Run the configure/compile/install toolchain inside `subdir`, pointing
  /// the configure step at the descriptor in `descriptor_dir`.
  Build { subdir: String, descriptor_dir: String },
}

/// The post-install smoke test: a minimal consumer program compiled against
/// the installed headers and linked against the installed library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
  /// Source text of the consumer program.
  pub source: String,
  /// Library name to link, as passed to `-l`.
  pub link: String,
}

/// Errors from loading or validating a formula.
#[derive(Debug, Error)]
pub enum FormulaError {
  #[error("failed to read formula {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse formula {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("invalid version '{version}': {source}")]
  Version {
    version: String,
    #[source]
    source: semver::Error,
  },

  #[error("invalid sha256 for {what}: '{digest}' is not 64 hex characters")]
  Digest { what: String, digest: String },

  #[error("duplicate resource name '{0}'")]
  DuplicateResource(String),

  #[error("install step references undeclared resource '{0}'")]
  UnknownResource(String),

  #[error("step path '{0}' must stay inside the build tree")]
  PathEscapes(String),

  #[error("descriptor template for '{dest}': {source}")]
  Template {
    dest: String,
    #[source]
    source: TemplateError,
  },

  #[error("descriptor template for '{dest}' does not interpolate '{binding}'")]
  MissingVersionBinding { dest: String, binding: String },
}

impl Formula {
  /// Load and validate a formula from a TOML descriptor file.
  pub fn from_path(path: &Path) -> Result<Self, FormulaError> {
    let text = std::fs::read_to_string(path).map_err(|source| FormulaError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::from_toml(&text, &path.display().to_string())
  }

  /// Parse and validate a formula from TOML text. `origin` names the source
  /// in errors.
  pub fn from_toml(text: &str, origin: &str) -> Result<Self, FormulaError> {
    let formula: Formula = toml::from_str(text).map_err(|source| FormulaError::Parse {
      path: origin.to_string(),
      source: Box::new(source),
    })?;
    formula.validate()?;
    Ok(formula)
  }

  /// The declared version, parsed.
  pub fn parsed_version(&self) -> Result<Version, FormulaError> {
    Version::parse(&self.version).map_err(|source| FormulaError::Version {
      version: self.version.clone(),
      source,
    })
  }

  /// The compatibility (ABI) version: the major component of the version.
  pub fn soversion(&self) -> Result<u64, FormulaError> {
    Ok(self.parsed_version()?.major)
  }

  /// Look up a declared resource by name.
  pub fn resource(&self, name: &str) -> Option<&Resource> {
    self.resources.iter().find(|r| r.name == name)
  }

  /// Validate the descriptor without executing anything.
  ///
  /// Checks digest format, version syntax, resource references, step path
  /// containment, and that every descriptor template parses and interpolates
  /// the `version` and `soversion` bindings (so the installed artifact's
  /// version metadata always matches the declared version).
  pub fn validate(&self) -> Result<(), FormulaError> {
    self.parsed_version()?;
    check_digest("source", &self.source.sha256)?;

    let mut seen = BTreeSet::new();
    for resource in &self.resources {
      check_digest(&format!("resource '{}'", resource.name), &resource.sha256)?;
      if !seen.insert(resource.name.as_str()) {
        return Err(FormulaError::DuplicateResource(resource.name.clone()));
      }
    }

    for step in &self.install {
      match step {
        InstallStep::Stage { resource, dest } => {
          if self.resource(resource).is_none() {
            return Err(FormulaError::UnknownResource(resource.clone()));
          }
          check_tree_relative(dest)?;
        }
        InstallStep::Render { dest, template } => {
          check_tree_relative(dest)?;
          let referenced = descriptor::referenced_bindings(template).map_err(|source| FormulaError::Template {
            dest: dest.clone(),
            source,
          })?;
          for required in ["version", "soversion"] {
            if !referenced.contains(required) {
              return Err(FormulaError::MissingVersionBinding {
                dest: dest.clone(),
                binding: required.to_string(),
              });
            }
          }
        }
        InstallStep::Build { subdir, descriptor_dir } => {
          check_tree_relative(subdir)?;
          check_tree_relative(descriptor_dir)?;
        }
      }
    }

    Ok(())
  }
}

fn check_digest(what: &str, digest: &str) -> Result<(), FormulaError> {
  if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
    Ok(())
  } else {
    Err(FormulaError::Digest {
      what: what.to_string(),
      digest: digest.to_string(),
    })
  }
}

/// A step path must be relative and may not climb out of the build tree.
fn check_tree_relative(path: &str) -> Result<(), FormulaError> {
  let p = Path::new(path);
  let contained = !path.is_empty()
    && p.is_relative()
    && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
  if contained {
    Ok(())
  } else {
    Err(FormulaError::PathEscapes(path.to_string()))
  }
}
