//! Test helpers.

use tempfile::TempDir;

use crate::worktree::MANAGEMENT_DIR_NAME;

/// An empty working tree in a new temporary directory.
pub fn working_tree() -> TempDir {
  let dir = TempDir::new().unwrap();
  std::fs::create_dir(dir.path().join(MANAGEMENT_DIR_NAME)).unwrap();
  dir
}
