//! Dynamic helpers: executables a redo runs, by name.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::fs::Path;

/// The first `prefix/path` of an existing object of the same type as `path` (directory or
/// non-directory), as an absolute path.
pub fn find_path_in(path: &Path, prefixes: &[PathBuf]) -> Option<Path> {
  if path.is_absolute() {
    return None;
  }
  prefixes.iter().find_map(|prefix| {
    let candidate = path.components().iter().fold(prefix.clone(), |p, c| p.join(c));
    let md = fs::metadata(&candidate).ok()?;
    if md.is_dir() != path.is_dir() {
      return None;
    }
    Path::from_native(&candidate, path.is_dir()).ok()
  })
}

/// Looks up helpers in the executable search paths; results are cached.
#[derive(Debug)]
pub(crate) struct HelperResolver {
  search_paths: Vec<PathBuf>,
  found: Mutex<BTreeMap<Path, Option<Path>>>,
}

impl HelperResolver {
  pub(crate) fn new(search_paths: Vec<PathBuf>) -> Self {
    HelperResolver {
      search_paths,
      found: Mutex::new(BTreeMap::new()),
    }
  }

  /// Search paths from the value of a `PATH`-like variable; relative entries are ignored.
  pub(crate) fn from_path_var(value: Option<&str>) -> Self {
    let search_paths = value
      .map(|v| std::env::split_paths(v).filter(|p| p.is_absolute()).collect())
      .unwrap_or_default();
    HelperResolver::new(search_paths)
  }

  pub(crate) fn find(&self, helper: &Path) -> Option<Path> {
    let mut found = self.found.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(cached) = found.get(helper) {
      return cached.clone();
    }
    let path = find_path_in(helper, &self.search_paths);
    debug!(helper = %helper, found = ?path.as_ref().map(Path::as_string), "searched helper");
    found.insert(helper.clone(), path.clone());
    path
  }
}

/// Handle to the helpers of a context; see [`Context::helper`].
pub struct HelperDict<'a> {
  ctx: &'a Context,
}

impl<'a> HelperDict<'a> {
  pub(crate) fn new(ctx: &'a Context) -> Self {
    HelperDict { ctx }
  }

  /// Assigns the helper `name` (a relative path like `gcc` or `bin/`) in this context only.
  ///
  /// A relative `path` is relative to the working tree root.
  pub fn set(&self, name: &str, path: impl AsRef<std::path::Path>) -> Result<()> {
    self.ctx.begin_modification("assign a helper")?;
    let key = helper_key(name)?;
    let path = path.as_ref();
    let absolute = if path.is_relative() {
      self.ctx.root.tree.root().join(path)
    } else {
      path.to_path_buf()
    };
    let value = Path::from_native(&absolute, key.is_dir())?;
    self.ctx.root.frames.borrow_mut()[self.ctx.depth].helpers.insert(key, value);
    Ok(())
  }

  /// Absolute path of the helper `name`: assigned in this or an outer context or, if enabled,
  /// found in the executable search paths.
  pub fn get(&self, name: &str) -> Result<Option<Path>> {
    let key = helper_key(name)?;
    let (explicit, find_helpers) = {
      let frames = self.ctx.root.frames.borrow();
      let chain = &frames[..=self.ctx.depth];
      let explicit = chain.iter().rev().find_map(|f| f.helpers.get(&key)).cloned();
      (explicit, chain[self.ctx.depth].find_helpers)
    };
    if explicit.is_some() || !find_helpers {
      return Ok(explicit);
    }
    Ok(self.ctx.root.resolver.find(&key))
  }
}

fn helper_key(name: &str) -> Result<Path> {
  let key = Path::new(name)?;
  if key.is_absolute() || key.components().is_empty() {
    return Err(Error::Helper(format!(
      "helper name must be a non-empty relative path: {name:?}"
    )));
  }
  Ok(key)
}
