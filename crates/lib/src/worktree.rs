//! Working tree and its management tree.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! └── .dlbroot/
//!     ├── lock          # exclusive lock, see `lock`
//!     ├── o             # mtime probe
//!     ├── t/            # temporary objects, recreated on every root entry
//!     └── runs-1.json   # run database
//! ```

pub mod lock;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path as NativePath, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result, first_line};
use crate::fs::Path;

pub const MANAGEMENT_DIR_NAME: &str = ".dlbroot";
pub const MTIME_PROBE_FILE_NAME: &str = "o";
pub const TEMPORARY_DIR_NAME: &str = "t";

/// A working tree with a prepared management tree.
///
/// Shared between the root context and its redo tasks.
#[derive(Debug)]
pub struct WorkingTree {
  root: PathBuf,
  root_path: Path,
  management_dir: PathBuf,
  case_sensitive: bool,
  mtime_probe: Mutex<File>,
}

impl WorkingTree {
  /// Checks that `dir` is the root of a working tree and returns its canonical native and
  /// absolute forms.
  pub fn locate(dir: &NativePath) -> Result<(PathBuf, Path)> {
    let root = dunce::canonicalize(dir).map_err(|e| {
      Error::NoWorkingTree(format!(
        "cannot access working tree root: {}\n  | reason: {}",
        dir.display(),
        first_line(&e)
      ))
    })?;
    let root_path = Path::from_native(&root, true)?;

    let is_management_dir = fs::symlink_metadata(root.join(MANAGEMENT_DIR_NAME))
      .map(|md| md.file_type().is_dir())
      .unwrap_or(false);
    if !is_management_dir {
      return Err(Error::NoWorkingTree(format!(
        "not a working tree: {}\n  | reason: does not contain a directory '{MANAGEMENT_DIR_NAME}' (that is not a symbolic link)",
        root_path.as_string()
      )));
    }
    Ok((root, root_path))
  }

  pub fn management_dir_of(root: &NativePath) -> PathBuf {
    root.join(MANAGEMENT_DIR_NAME)
  }

  /// Prepares the management tree of a locked working tree: recreates the temporary directory and
  /// the mtime probe.
  pub fn prepare(root: PathBuf, root_path: Path) -> Result<WorkingTree> {
    let management_dir = Self::management_dir_of(&root);
    let setup_err = |e: io::Error| {
      Error::management_tree(
        format!(
          "failed to set up management tree for {}\n  | reason: {}",
          root_path.as_string(),
          first_line(&e)
        ),
        e,
      )
    };

    let temporary_dir = management_dir.join(TEMPORARY_DIR_NAME);
    remove_filesystem_object(&temporary_dir, None, true).map_err(setup_err)?;
    fs::create_dir(&temporary_dir).map_err(setup_err)?;

    let probe_path = management_dir.join(MTIME_PROBE_FILE_NAME);
    let probe_upper_path = management_dir.join(MTIME_PROBE_FILE_NAME.to_uppercase());
    remove_filesystem_object(&probe_path, None, true).map_err(setup_err)?;
    remove_filesystem_object(&probe_upper_path, None, true).map_err(setup_err)?;

    // always a fresh file, never a link to an existing one
    let probe = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&probe_path)
      .map_err(setup_err)?;
    let case_sensitive = match fs::symlink_metadata(&probe_upper_path) {
      Ok(_) => false,
      Err(e) if e.kind() == io::ErrorKind::NotFound => true,
      Err(e) => return Err(setup_err(e)),
    };

    debug!(root = %root_path, case_sensitive, "prepared management tree");
    Ok(WorkingTree {
      root,
      root_path,
      management_dir,
      case_sensitive,
      mtime_probe: Mutex::new(probe),
    })
  }

  pub fn root(&self) -> &NativePath {
    &self.root
  }

  /// The root as an absolute directory path.
  pub fn root_path(&self) -> &Path {
    &self.root_path
  }

  pub fn management_dir(&self) -> &NativePath {
    &self.management_dir
  }

  pub fn temporary_dir(&self) -> PathBuf {
    self.management_dir.join(TEMPORARY_DIR_NAME)
  }

  pub fn is_case_sensitive(&self) -> bool {
    self.case_sensitive
  }

  /// Native form of a managed tree path.
  pub fn native_of(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      return path.native();
    }
    path.components().iter().fold(self.root.clone(), |p, c| p.join(c))
  }

  /// Current working tree time: the mtime in nanoseconds the filesystem assigns to a file
  /// modified now.
  ///
  /// Monotonic as long as the system time is; its resolution is the filesystem's.
  pub fn working_tree_time_ns(&self) -> Result<i64> {
    let time_err = |e: io::Error| {
      Error::WorkingTreeTime(format!("failed to read working tree time\n  | reason: {}", first_line(&e)))
    };
    let mut probe = self
      .mtime_probe
      .lock()
      .map_err(|_| Error::WorkingTreeTime("mtime probe is poisoned".to_string()))?;
    probe.seek(SeekFrom::Start(0)).map_err(time_err)?;
    probe.write_all(b"0").map_err(time_err)?;
    let md = probe.metadata().map_err(time_err)?;
    mtime_ns(&md).map_err(time_err)
  }

  /// Waits until the working tree time is later than `t0`.
  pub fn wait_for_time_after(&self, t0: i64, timeout: Duration) -> Result<i64> {
    let started = Instant::now();
    loop {
      let t = self.working_tree_time_ns()?;
      if t > t0 {
        return Ok(t);
      }
      if started.elapsed() >= timeout {
        return Err(Error::WorkingTreeTime(format!(
          "working tree time did not change for at least {}\n  | is the system time adjusted backwards?",
          humantime::format_duration(timeout)
        )));
      }
      std::thread::sleep(Duration::from_millis(15));
    }
  }

  /// The managed tree path of `path`: relative to the root, without `..` components.
  ///
  /// `..` components are collapsed only if the prefix before them is not a symbolic link. Paths
  /// in the management tree are rejected, except ones in the temporary directory when
  /// `allow_temporary` is set. Unless `existing` is set, the object must exist and its type
  /// determines whether the returned path is a directory path.
  pub fn working_tree_path_of(&self, path: &Path, existing: bool, allow_temporary: bool) -> Result<Path> {
    let rel_components = if path.is_absolute() {
      let normalized = collapse_dotdot(path, path.components(), Some(&absolute_base()))?;
      let n = self.root_path.components().len();
      if normalized.len() < n || normalized[..n] != self.root_path.components()[..] {
        return Err(Error::working_tree_path(format!(
          "does not start with the working tree's root path: {}",
          path.as_string()
        )));
      }
      normalized[n..].to_vec()
    } else {
      collapse_dotdot(path, path.components(), Some(&self.root))?
    };

    if rel_components.first().map(String::as_str) == Some(MANAGEMENT_DIR_NAME) {
      let in_temporary = rel_components.get(1).map(String::as_str) == Some(TEMPORARY_DIR_NAME);
      if !(in_temporary && allow_temporary) {
        return Err(Error::working_tree_path(format!(
          "path in non-permitted part of the working tree: {}",
          path.as_string()
        )));
      }
    }

    let mut rel = Path::from_components(false, rel_components, path.is_dir());
    if !existing {
      let md = fs::symlink_metadata(self.native_of(&rel)).map_err(|e| Error::WorkingTreePath {
        message: format!("cannot access {}\n  | reason: {}", path.as_string(), first_line(&e)),
        source: Some(Arc::new(e)),
      })?;
      rel = rel.with_is_dir(md.file_type().is_dir());
    }
    Ok(rel)
  }
}

#[cfg(unix)]
fn absolute_base() -> PathBuf {
  PathBuf::from("/")
}

#[cfg(not(unix))]
fn absolute_base() -> PathBuf {
  PathBuf::from(std::path::MAIN_SEPARATOR_STR)
}

fn collapse_dotdot(path: &Path, components: &[String], ref_dir: Option<&NativePath>) -> Result<Vec<String>> {
  let mut out = components.to_vec();
  while let Some(i) = out.iter().position(|c| c == "..") {
    if i == 0 {
      return Err(Error::working_tree_path(format!("is an upwards path: {}", path.as_string())));
    }
    if let Some(ref_dir) = ref_dir {
      let prefix = out[..i].iter().fold(ref_dir.to_path_buf(), |p, c| p.join(c));
      let md = fs::symlink_metadata(&prefix).map_err(|e| Error::WorkingTreePath {
        message: format!("cannot collapse {}\n  | reason: {}", path.as_string(), first_line(&e)),
        source: Some(Arc::new(e)),
      })?;
      if md.file_type().is_symlink() {
        return Err(Error::working_tree_path(format!(
          "not a collapsable path, since this is a symbolic link: {}",
          prefix.display()
        )));
      }
    }
    out.drain(i - 1..=i);
  }
  Ok(out)
}

#[cfg(unix)]
pub(crate) fn mtime_ns(md: &fs::Metadata) -> io::Result<i64> {
  use std::os::unix::fs::MetadataExt;
  Ok(md.mtime().saturating_mul(1_000_000_000).saturating_add(md.mtime_nsec()))
}

#[cfg(not(unix))]
pub(crate) fn mtime_ns(md: &fs::Metadata) -> io::Result<i64> {
  let d = md.modified()?.duration_since(std::time::UNIX_EPOCH).map_err(io::Error::other)?;
  Ok(d.as_nanos().min(i64::MAX as u128) as i64)
}

/// Removes the filesystem object at `abs_path`; a symbolic link is removed, not its target.
///
/// A directory is first moved to a new name from `moved_to` (if given, a directory on the same
/// filesystem) and then removed as far as possible, which makes its disappearance atomic.
pub fn remove_filesystem_object(
  abs_path: &NativePath,
  moved_to: Option<&UniquePathProvider>,
  ignore_non_existent: bool,
) -> io::Result<()> {
  let md = match fs::symlink_metadata(abs_path) {
    Ok(md) => md,
    Err(e) if e.kind() == io::ErrorKind::NotFound && ignore_non_existent => return Ok(()),
    Err(e) => return Err(e),
  };

  if !md.file_type().is_dir() {
    return match fs::remove_file(abs_path) {
      Err(e) if e.kind() == io::ErrorKind::NotFound && ignore_non_existent => Ok(()),
      r => r,
    };
  }

  match moved_to {
    None => fs::remove_dir_all(abs_path),
    Some(provider) => {
      let moved = provider.dir().join(provider.generate_name("").map_err(io::Error::other)?);
      fs::rename(abs_path, &moved)?;
      if let Err(e) = fs::remove_dir_all(&moved) {
        debug!(path = %moved.display(), error = %e, "failed to remove moved directory");
      }
      Ok(())
    }
  }
}

/// Generates unique names in one directory.
///
/// A name starts with a lowercase letter, continues with lowercase letters and digits and ends
/// with the suffix.
#[derive(Debug)]
pub struct UniquePathProvider {
  dir: PathBuf,
  next: AtomicU64,
}

const FIRST_CHARACTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const CHARACTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

impl UniquePathProvider {
  pub fn new(dir: PathBuf) -> Self {
    UniquePathProvider {
      dir,
      next: AtomicU64::new(0),
    }
  }

  pub fn dir(&self) -> &NativePath {
    &self.dir
  }

  pub fn generate_name(&self, suffix: &str) -> Result<String> {
    if let Some(c) = suffix.chars().next()
      && !c.is_ascii_punctuation()
    {
      return Err(Error::working_tree_path(format!(
        "non-empty suffix must start with a punctuation character, not {c:?}"
      )));
    }
    if suffix.contains('/') || suffix.contains('\\') {
      return Err(Error::working_tree_path(format!(
        "suffix must not contain a path separator: {suffix:?}"
      )));
    }

    let i = self.next.fetch_add(1, Ordering::Relaxed);
    Ok(format!("{}{suffix}", unique_stem(i)))
  }
}

fn unique_stem(i: u64) -> String {
  let first = FIRST_CHARACTERS.len() as u64;
  let rest = CHARACTERS.len() as u64;
  let mut name = vec![FIRST_CHARACTERS[(i % first) as usize]];
  let mut i = i / first;
  while i > 0 {
    i -= 1;
    name.push(CHARACTERS[(i % rest) as usize]);
    i /= rest;
  }
  String::from_utf8_lossy(&name).into_owned()
}

/// A temporary file or directory, removed on drop.
#[derive(Debug)]
pub struct Temporary {
  native: PathBuf,
  path: Path,
}

impl Temporary {
  pub fn create(provider: &UniquePathProvider, suffix: &str, is_dir: bool) -> Result<Temporary> {
    let name = provider.generate_name(suffix)?;
    let native = provider.dir().join(&name);
    let create_err = |e: io::Error| {
      Error::management_tree(
        format!("failed to create temporary {}\n  | reason: {}", native.display(), first_line(&e)),
        e,
      )
    };
    if is_dir {
      fs::create_dir(&native).map_err(create_err)?;
    } else {
      OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&native)
        .map_err(create_err)?;
    }
    let path = Path::from_native(&native, is_dir)?;
    Ok(Temporary { native, path })
  }

  /// Absolute path.
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn native(&self) -> &NativePath {
    &self.native
  }
}

impl Drop for Temporary {
  fn drop(&mut self) {
    if let Err(e) = remove_filesystem_object(&self.native, None, true) {
      debug!(path = %self.native.display(), error = %e, "failed to remove temporary");
    }
  }
}
