//! Shared download cache.
//!
//! Verified archives are cached on disk keyed by their expected digest plus a
//! filename derived from the URL, so independent builds of different formulas
//! can share downloads. The cache is read-mostly: entries are published with a
//! write-to-temp-then-rename so a concurrent reader never observes a partially
//! written archive. A hit is re-verified against the expected digest before it
//! is trusted; a corrupt entry is discarded and re-downloaded.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::digest;

/// On-disk cache of verified downloads.
#[derive(Debug, Clone)]
pub struct DownloadCache {
  dir: PathBuf,
}

impl DownloadCache {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  /// The default per-user cache location (`~/.cache/keg/downloads` on Linux).
  pub fn default_dir() -> PathBuf {
    dirs::cache_dir()
      .unwrap_or_else(std::env::temp_dir)
      .join("keg")
      .join("downloads")
  }

  /// The path an entry for `url` + `sha256` would live at.
  pub fn entry_path(&self, url: &str, sha256: &str) -> PathBuf {
    let prefix = &sha256[..12.min(sha256.len())];
    self.dir.join(format!("{}-{}", prefix.to_ascii_lowercase(), filename_for_url(url)))
  }

  /// Look up a cached download, re-verifying its digest.
  ///
  /// Returns `None` on a miss. A present-but-corrupt entry is removed and
  /// treated as a miss rather than surfaced as an error: the fetcher will
  /// simply download again.
  pub fn lookup(&self, url: &str, sha256: &str) -> Option<PathBuf> {
    let path = self.entry_path(url, sha256);
    if !path.exists() {
      return None;
    }

    match digest::hash_file(&path) {
      Ok(actual) if actual.eq_ignore_ascii_case(sha256) => {
        debug!(path = %path.display(), "download cache hit");
        Some(path)
      }
      Ok(actual) => {
        warn!(path = %path.display(), expected = %sha256, actual = %actual, "corrupt cache entry, discarding");
        fs::remove_file(&path).ok();
        None
      }
      Err(e) => {
        warn!(path = %path.display(), error = %e, "unreadable cache entry, discarding");
        fs::remove_file(&path).ok();
        None
      }
    }
  }

  /// Publish verified bytes into the cache atomically.
  ///
  /// The bytes are written to a temp file in the cache directory and renamed
  /// into place, so the entry path only ever names complete content.
  pub fn insert(&self, url: &str, sha256: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    fs::create_dir_all(&self.dir)?;
    let path = self.entry_path(url, sha256);

    let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.persist(&path).map_err(|e| e.error)?;

    debug!(path = %path.display(), size = bytes.len(), "cached download");
    Ok(path)
  }
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component, drops any query string, and sanitizes the
/// rest. Falls back to a hash of the URL if nothing usable remains.
pub fn filename_for_url(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split('?').next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  format!("download_{}", &hex::encode(hasher.finalize())[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  use crate::digest::hash_bytes;

  #[test]
  fn filename_simple() {
    assert_eq!(filename_for_url("https://example.com/file.tar.gz"), "file.tar.gz");
  }

  #[test]
  fn filename_with_query() {
    assert_eq!(
      filename_for_url("https://example.com/file.tar.gz?token=abc"),
      "file.tar.gz"
    );
  }

  #[test]
  fn filename_sanitizes_special_chars() {
    assert_eq!(
      filename_for_url("https://example.com/file name.tar.gz"),
      "file_name.tar.gz"
    );
  }

  #[test]
  fn filename_fallback_for_empty() {
    assert!(filename_for_url("https://example.com/").starts_with("download_"));
  }

  #[test]
  fn insert_then_lookup_roundtrip() {
    let temp = TempDir::new().unwrap();
    let cache = DownloadCache::new(temp.path());

    let bytes = b"archive bytes";
    let sha = hash_bytes(bytes);
    let url = "https://example.com/pkg-1.0.tar.gz";

    let stored = cache.insert(url, &sha, bytes).unwrap();
    assert_eq!(std::fs::read(&stored).unwrap(), bytes);

    let hit = cache.lookup(url, &sha).unwrap();
    assert_eq!(hit, stored);
  }

  #[test]
  fn lookup_misses_when_absent() {
    let temp = TempDir::new().unwrap();
    let cache = DownloadCache::new(temp.path());
    assert!(cache.lookup("https://example.com/a.tar.gz", &hash_bytes(b"x")).is_none());
  }

  #[test]
  fn corrupt_entry_is_discarded() {
    let temp = TempDir::new().unwrap();
    let cache = DownloadCache::new(temp.path());

    let bytes = b"archive bytes";
    let sha = hash_bytes(bytes);
    let url = "https://example.com/pkg-1.0.tar.gz";

    let stored = cache.insert(url, &sha, bytes).unwrap();
    std::fs::write(&stored, b"truncated").unwrap();

    assert!(cache.lookup(url, &sha).is_none());
    assert!(!stored.exists());
  }

  #[test]
  fn entry_paths_differ_per_digest() {
    let temp = TempDir::new().unwrap();
    let cache = DownloadCache::new(temp.path());
    let url = "https://example.com/pkg-1.0.tar.gz";

    let a = cache.entry_path(url, &hash_bytes(b"a"));
    let b = cache.entry_path(url, &hash_bytes(b"b"));
    assert_ne!(a, b);
  }
}
