//! SHA-256 digests for download verification and content comparison.
//!
//! Downloads are verified against the full 64-character lowercase hex digest
//! declared in the formula. Comparison is case-insensitive so descriptors may
//! carry uppercase digests; everything this module produces is lowercase.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors from digest computation or verification.
#[derive(Debug, Error)]
pub enum DigestError {
  /// The computed digest does not match the expected one. Always fatal:
  /// content that fails verification must never be staged or extracted.
  #[error("digest mismatch: expected {expected}, got {actual}")]
  Mismatch { expected: String, actual: String },

  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to walk directory {path}: {message}")]
  Walk { path: String, message: String },
}

/// Compute the SHA-256 digest of a byte slice as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// Compute the SHA-256 digest of a file's contents as lowercase hex.
///
/// Reads in fixed-size chunks so large archives never have to be held in
/// memory just to be hashed.
pub fn hash_file(path: &Path) -> Result<String, DigestError> {
  let file = File::open(path).map_err(|source| DigestError::Read {
    path: path.display().to_string(),
    source,
  })?;
  let mut reader = BufReader::new(file);
  let mut hasher = Sha256::new();

  let mut buffer = [0u8; 8192];
  loop {
    let n = reader.read(&mut buffer).map_err(|source| DigestError::Read {
      path: path.display().to_string(),
      source,
    })?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(hex::encode(hasher.finalize()))
}

/// Verify a byte stream against an expected hex digest.
///
/// The digest is computed over the exact bytes given, with no normalization
/// or partial hashing. Comparison is case-insensitive.
pub fn verify_bytes(data: &[u8], expected: &str) -> Result<(), DigestError> {
  let actual = hash_bytes(data);
  if actual.eq_ignore_ascii_case(expected) {
    Ok(())
  } else {
    Err(DigestError::Mismatch {
      expected: expected.to_ascii_lowercase(),
      actual,
    })
  }
}

/// Compute a deterministic digest of a directory's contents.
///
/// Includes file contents, the relative directory structure, and symlink
/// targets; excludes metadata like timestamps. Entries are visited in sorted
/// order so two trees with identical content always hash identically.
///
/// `exclude` lists entry names to skip at any depth.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<String, DigestError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| DigestError::Walk {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;

    let rel = entry
      .path()
      .strip_prefix(path)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .to_string();

    let file_type = entry.file_type();
    if file_type.is_symlink() {
      let target = std::fs::read_link(entry.path()).map_err(|source| DigestError::Read {
        path: entry.path().display().to_string(),
        source,
      })?;
      entries.push((rel, format!("link:{}", target.display())));
    } else if file_type.is_file() {
      entries.push((rel, format!("file:{}", hash_file(entry.path())?)));
    } else if file_type.is_dir() {
      entries.push((rel, "dir".to_string()));
    }
  }

  let mut hasher = Sha256::new();
  for (rel, kind) in entries {
    hasher.update(rel.as_bytes());
    hasher.update([0]);
    hasher.update(kind.as_bytes());
    hasher.update([0]);
  }

  Ok(hex::encode(hasher.finalize()))
}
