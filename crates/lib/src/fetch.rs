//! Resource download, verification, and staging.
//!
//! A download is held fully in memory and verified against its declared
//! SHA-256 digest before a single byte is persisted or extracted; content
//! that fails verification never reaches the build tree. Staging clears the
//! destination's previous content first, so re-staging the same archive is
//! deterministic.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::DownloadCache;
use crate::digest::{self, DigestError};

/// Errors from fetching or staging a resource.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The resource was unreachable or the server answered with an error.
  #[error("fetch failed for {url}: {message}")]
  Network { url: String, message: String },

  /// The downloaded bytes do not match the declared digest.
  #[error("digest verification failed for {url}: {source}")]
  Digest {
    url: String,
    #[source]
    source: DigestError,
  },

  /// The archive's filename does not indicate a supported format.
  #[error("unsupported archive format: {0}")]
  UnsupportedArchive(String),

  /// The archive could not be unpacked.
  #[error("failed to extract {archive}: {message}")]
  Extract { archive: String, message: String },

  /// Extraction finished but staged nothing. Treated as a hard failure so a
  /// missing resource surfaces here instead of as a later toolchain error.
  #[error("archive {archive} staged no content at {dest}")]
  EmptyStage { archive: String, dest: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Download a URL and verify it against the expected digest.
///
/// Checks the shared cache first; on a miss the body is downloaded fully into
/// memory, verified, and only then published to the cache. Returns the path
/// of the verified archive.
pub async fn fetch_archive(url: &str, sha256: &str, cache: &DownloadCache) -> Result<PathBuf, FetchError> {
  if let Some(hit) = cache.lookup(url, sha256) {
    info!(url = %url, path = %hit.display(), "using cached download");
    return Ok(hit);
  }

  info!(url = %url, "fetching URL");

  let response = reqwest::get(url).await.map_err(|e| FetchError::Network {
    url: url.to_string(),
    message: e.to_string(),
  })?;

  if !response.status().is_success() {
    return Err(FetchError::Network {
      url: url.to_string(),
      message: format!("HTTP {}", response.status()),
    });
  }

  let bytes = response.bytes().await.map_err(|e| FetchError::Network {
    url: url.to_string(),
    message: e.to_string(),
  })?;

  digest::verify_bytes(&bytes, sha256).map_err(|source| FetchError::Digest {
    url: url.to_string(),
    source,
  })?;

  let path = cache.insert(url, sha256, &bytes)?;
  info!(url = %url, path = %path.display(), size = bytes.len(), "download complete");

  Ok(path)
}

/// Unpack a verified archive into `dest`.
///
/// The format is inferred from the archive filename (`.tar.gz`/`.tgz`,
/// `.tar`, `.zip`) and the leading path component of every entry is stripped,
/// matching the single-top-level-directory layout of release tarballs. Any
/// previous content of `dest` is removed first, and an archive that stages
/// nothing is an error.
pub fn stage_archive(archive: &Path, dest: &Path) -> Result<(), FetchError> {
  let name = archive
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();

  clear_dir(dest)?;

  if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
    unpack_tar(GzDecoder::new(BufReader::new(File::open(archive)?)), archive, dest)?;
  } else if name.ends_with(".tar") {
    unpack_tar(BufReader::new(File::open(archive)?), archive, dest)?;
  } else if name.ends_with(".zip") {
    unpack_zip(archive, dest)?;
  } else {
    return Err(FetchError::UnsupportedArchive(name));
  }

  if fs::read_dir(dest)?.next().is_none() {
    return Err(FetchError::EmptyStage {
      archive: archive.display().to_string(),
      dest: dest.display().to_string(),
    });
  }

  info!(archive = %archive.display(), dest = %dest.display(), "staged archive");
  Ok(())
}

/// Remove every entry beneath `dir`, creating it if absent.
///
/// The directory itself is kept so staging into a caller-owned path (such as
/// the build tree root) never deletes the caller's directory.
fn clear_dir(dir: &Path) -> std::io::Result<()> {
  if !dir.exists() {
    fs::create_dir_all(dir)?;
    return Ok(());
  }

  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if entry.file_type()?.is_dir() {
      fs::remove_dir_all(&path)?;
    } else {
      fs::remove_file(&path)?;
    }
  }

  debug!(dir = %dir.display(), "cleared staging destination");
  Ok(())
}

fn unpack_tar<R: std::io::Read>(reader: R, archive_path: &Path, dest: &Path) -> Result<(), FetchError> {
  let mut archive = Archive::new(reader);

  let entries = archive.entries().map_err(|e| extract_err(archive_path, e))?;
  for entry in entries {
    let mut entry = entry.map_err(|e| extract_err(archive_path, e))?;
    let path = entry.path().map_err(|e| extract_err(archive_path, e))?;

    // Strip the top-level component (e.g., link-3.1.5/)
    let stripped: PathBuf = path.components().skip(1).collect();
    if stripped.as_os_str().is_empty() {
      continue;
    }

    let dest_path = dest.join(&stripped);
    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }

    entry.unpack(&dest_path).map_err(|e| extract_err(archive_path, e))?;
  }

  Ok(())
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<(), FetchError> {
  let file = File::open(archive_path)?;
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| extract_err(archive_path, e))?;

  for i in 0..archive.len() {
    let mut file = archive.by_index(i).map_err(|e| extract_err(archive_path, e))?;

    let path = file.enclosed_name().ok_or_else(|| FetchError::Extract {
      archive: archive_path.display().to_string(),
      message: "invalid zip entry name".to_string(),
    })?;

    // Strip the top-level component
    let stripped: PathBuf = path.components().skip(1).collect();
    if stripped.as_os_str().is_empty() {
      continue;
    }

    let dest_path = dest.join(&stripped);

    if file.is_dir() {
      fs::create_dir_all(&dest_path)?;
    } else {
      if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)?;
      }

      let mut outfile = File::create(&dest_path)?;
      std::io::copy(&mut file, &mut outfile)?;

      #[cfg(unix)]
      {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = file.unix_mode() {
          fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode))?;
        }
      }
    }
  }

  Ok(())
}

fn extract_err(archive: &Path, e: impl std::fmt::Display) -> FetchError {
  FetchError::Extract {
    archive: archive.display().to_string(),
    message: e.to_string(),
  }
}
