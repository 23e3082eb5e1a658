//! Isolated build trees.
//!
//! Every build gets a fresh, uniquely named temporary directory that owns all
//! staged resources and generated files. The tree is removed when it goes out
//! of scope, on every exit path: normal completion, an error, or cancellation
//! (dropping the pipeline future drops the tree with it). Trees are never
//! shared between builds.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

/// An exclusively-owned temporary build directory.
///
/// Removal happens exactly once, in `Drop`.
#[derive(Debug)]
pub struct BuildTree {
  dir: TempDir,
}

impl BuildTree {
  /// Create a fresh build tree.
  pub fn create() -> std::io::Result<Self> {
    let dir = tempfile::Builder::new().prefix("keg-build-").tempdir()?;
    debug!(path = %dir.path().display(), "created build tree");
    Ok(Self { dir })
  }

  /// The root of the tree. All staged and generated paths live beneath it.
  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

impl Drop for BuildTree {
  fn drop(&mut self) {
    debug!(path = %self.dir.path().display(), "removing build tree");
  }
}

/// Run `f` with a fresh build tree, removing the tree on every exit path.
///
/// The tree's lifetime is exactly the dynamic extent of `f`: it is created
/// immediately before the call and dropped immediately after, whether `f`
/// returns `Ok`, returns `Err`, or is cancelled by dropping the future.
pub async fn with_build_tree<F, Fut, T, E>(f: F) -> Result<T, E>
where
  F: FnOnce(PathBuf) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: From<std::io::Error>,
{
  let tree = BuildTree::create()?;
  let result = f(tree.path().to_path_buf()).await;
  drop(tree);
  result
}
