//! What a redo works with, and what it leaves behind.
//!
//! - [`RedoContext`]: read-only view of the context a redo was started in; runs helpers.
//! - [`RedoResult`]: write-once slots for the non-explicit dependencies, filled by the redo.
//! - [`RunResult`]: the sealed, immutable result of a run.
//! - [`ResultProxy`]: handle returned by `ToolInstance::start()`; blocks on first access.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::process::Stdio;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::context::Root;
use crate::context::helper::HelperResolver;
use crate::depend::{Concrete, Dependency, Raw};
use crate::error::{Error, Result, first_line};
use crate::fs::{Path, PathClass};
use crate::sequence::TaskId;
use crate::tool::Fingerprint;
use crate::worktree::{Temporary, UniquePathProvider, WorkingTree, remove_filesystem_object};

/// How a helper is executed by [`RedoContext::execute_helper_with`].
#[derive(Debug, Clone)]
pub struct HelperExecution {
  /// Working directory, relative to the working tree root. Default: the root.
  pub cwd: Option<Path>,
  pub expected_exit_codes: Vec<i32>,
  /// Environment variables set in addition to the context's.
  pub env: BTreeMap<String, String>,
  /// Inherit stdin, stdout and stderr. Default: from the configuration.
  pub inherit_files: Option<bool>,
}

impl Default for HelperExecution {
  fn default() -> Self {
    HelperExecution {
      cwd: None,
      expected_exit_codes: vec![0],
      env: BTreeMap::new(),
      inherit_files: None,
    }
  }
}

pub(crate) struct RedoContextInner {
  pub tree: Arc<WorkingTree>,
  pub temp: Arc<UniquePathProvider>,
  pub env: BTreeMap<String, String>,
  pub helpers: BTreeMap<Path, Path>,
  pub find_helpers: bool,
  pub resolver: Arc<HelperResolver>,
  pub path_class: PathClass,
  pub inherits_files: bool,
  /// Managed tree paths of the explicit outputs, with their `replace_by_same_content`.
  pub explicit_outputs: BTreeMap<Path, bool>,
  pub modified_outputs: Mutex<BTreeSet<Path>>,
}

/// Snapshot of the context a redo was started in.
///
/// A redo cannot change its context; it can read the environment variables and helpers, create
/// temporary objects, run helpers and replace its explicit outputs.
#[derive(Clone)]
pub struct RedoContext {
  inner: Arc<RedoContextInner>,
}

impl RedoContext {
  pub(crate) fn new(inner: RedoContextInner) -> Self {
    RedoContext { inner: Arc::new(inner) }
  }

  /// Absolute path of the working tree root.
  pub fn root_path(&self) -> &Path {
    self.inner.tree.root_path()
  }

  /// Native form of `path`; a relative path is relative to the working tree root.
  pub fn native_of(&self, path: &Path) -> std::path::PathBuf {
    self.inner.tree.native_of(path)
  }

  pub fn env(&self) -> &BTreeMap<String, String> {
    &self.inner.env
  }

  pub fn path_class(&self) -> PathClass {
    self.inner.path_class
  }

  /// Absolute path of the helper `name`, explicit or found in the executable search paths.
  pub fn helper(&self, name: &str) -> Result<Path> {
    let key = Path::new(name)?;
    if let Some(p) = self.inner.helpers.get(&key) {
      return Ok(p.clone());
    }
    if self.inner.find_helpers
      && let Some(p) = self.inner.resolver.find(&key)
    {
      return Ok(p);
    }
    Err(Error::Helper(format!(
      "not a known dynamic helper in the context: {name:?}\n  | use 'context.helper().set(...)' to define it"
    )))
  }

  /// Creates a regular file (or directory) in the temporary area; removed when dropped.
  pub fn temporary(&self, suffix: &str, is_dir: bool) -> Result<Temporary> {
    Temporary::create(&self.inner.temp, suffix, is_dir)
  }

  pub fn working_tree_path_of(&self, path: &Path, existing: bool, allow_temporary: bool) -> Result<Path> {
    let rel = self.inner.tree.working_tree_path_of(path, existing, allow_temporary)?;
    self.inner.path_class.check(&rel)?;
    Ok(rel)
  }

  pub(crate) fn modified_outputs(&self) -> BTreeSet<Path> {
    lock(&self.inner.modified_outputs).clone()
  }

  /// Runs `helper` with `args` in the working tree root and waits for it to exit with 0.
  pub async fn execute_helper<I, S>(&self, helper: &str, args: I) -> Result<i32>
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    self.execute_helper_with(helper, args, HelperExecution::default()).await
  }

  pub async fn execute_helper_with<I, S>(&self, helper: &str, args: I, options: HelperExecution) -> Result<i32>
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    let (code, _) = self.run_helper(helper, args, options, false).await?;
    Ok(code)
  }

  /// Like [`execute_helper_with`](Self::execute_helper_with), but captures stdout.
  pub async fn execute_helper_with_output<I, S>(
    &self,
    helper: &str,
    args: I,
    options: HelperExecution,
  ) -> Result<(i32, Vec<u8>)>
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    self.run_helper(helper, args, options, true).await
  }

  async fn run_helper<I, S>(&self, helper: &str, args: I, options: HelperExecution, capture: bool) -> Result<(i32, Vec<u8>)>
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    let exe = self.helper(helper)?;
    let cwd = match &options.cwd {
      Some(cwd) => {
        let rel = self.working_tree_path_of(cwd, false, true)?;
        if !rel.is_dir() {
          return Err(Error::working_tree_path(format!(
            "working directory of helper is not a directory: {}",
            cwd.as_string()
          )));
        }
        self.inner.tree.native_of(&rel)
      }
      None => self.inner.tree.root().to_path_buf(),
    };
    let inherit = options.inherit_files.unwrap_or(self.inner.inherits_files);
    let io_mode = || if inherit { Stdio::inherit() } else { Stdio::null() };

    let mut cmd = tokio::process::Command::new(exe.native());
    cmd
      .args(args.into_iter().map(Into::into))
      .current_dir(&cwd)
      .env_clear()
      .envs(&self.inner.env)
      .envs(&options.env)
      .stdin(io_mode())
      .stdout(if capture { Stdio::piped() } else { io_mode() })
      .stderr(io_mode())
      .kill_on_drop(true);

    info!(helper = %exe, cwd = %cwd.display(), "execute helper");
    let spawn_err = |e: io::Error| Error::HelperExecution {
      message: format!("failed to execute helper {:?}\n  | reason: {}", exe.as_string(), first_line(&e)),
      source: Some(Arc::new(e)),
    };
    let output = cmd.output().await.map_err(spawn_err)?;

    let Some(code) = output.status.code() else {
      return Err(Error::HelperExecution {
        message: format!("execution of {:?} was terminated by a signal", exe.as_string()),
        source: None,
      });
    };
    if !options.expected_exit_codes.contains(&code) {
      return Err(Error::HelperExecution {
        message: format!(
          "execution of {:?} returned unexpected exit code {code}\n  | expected one of {:?}",
          exe.as_string(),
          options.expected_exit_codes
        ),
        source: None,
      });
    }
    debug!(helper = %exe, code, "helper exited");
    Ok((code, output.stdout))
  }

  /// Replaces the explicit output `path` by the object at `source` (usually a temporary).
  ///
  /// Returns `false` if the output was kept because it is a regular file with the same content
  /// and its dependency does not replace by same content.
  pub fn replace_output(&self, path: &Path, source: &Path) -> Result<bool> {
    let dest = self.working_tree_path_of(path, true, false)?;
    let Some(&replace_by_same_content) = self.inner.explicit_outputs.get(&dest) else {
      return Err(Error::Redo(format!(
        "path is not an explicit output dependency of the running redo: {}",
        path.as_string()
      )));
    };
    let src = self.working_tree_path_of(source, false, true)?;
    if src == dest {
      return Err(Error::Redo(format!("cannot replace a path by itself: {}", path.as_string())));
    }
    if src.is_dir() != dest.is_dir() {
      return Err(Error::Redo(format!(
        "cannot replace {} by an object of different type: {}",
        dest.as_string(),
        src.as_string()
      )));
    }

    let src_native = self.inner.tree.native_of(&src);
    let dest_native = self.inner.tree.native_of(&dest);
    let replace_err = |e: io::Error| {
      Error::Redo(format!(
        "failed to replace output: {}\n  | reason: {}",
        dest.as_string(),
        first_line(&e)
      ))
    };

    if !replace_by_same_content
      && !dest.is_dir()
      && same_regular_file_content(&src_native, &dest_native).map_err(replace_err)?
    {
      remove_filesystem_object(&src_native, None, true).map_err(replace_err)?;
      debug!(path = %dest, "kept output with same content");
      return Ok(false);
    }

    if dest.is_dir() {
      remove_filesystem_object(&dest_native, Some(self.inner.temp.as_ref()), true).map_err(replace_err)?;
    }
    fs::rename(&src_native, &dest_native).map_err(replace_err)?;
    lock(&self.inner.modified_outputs).insert(dest);
    Ok(true)
  }
}

fn same_regular_file_content(a: &std::path::Path, b: &std::path::Path) -> io::Result<bool> {
  let (ma, mb) = match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
    (Ok(ma), Ok(mb)) => (ma, mb),
    (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
    (Err(e), _) | (_, Err(e)) => return Err(e),
  };
  if !ma.is_file() || !mb.is_file() || ma.len() != mb.len() {
    return Ok(false);
  }
  Ok(fs::read(a)? == fs::read(b)?)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ResultSlots {
  dependencies: Arc<Vec<(String, Dependency)>>,
  values: BTreeMap<String, Concrete>,
  sealed: bool,
}

/// Write-once slots of a running redo.
///
/// Explicit dependencies are readable from the start. Each non-explicit one can be assigned once
/// while the redo runs; afterwards the result is sealed into a [`RunResult`].
#[derive(Clone)]
pub struct RedoResult {
  slots: Arc<Mutex<ResultSlots>>,
}

impl RedoResult {
  pub(crate) fn new(dependencies: Arc<Vec<(String, Dependency)>>, explicit: BTreeMap<String, Concrete>) -> Self {
    RedoResult {
      slots: Arc::new(Mutex::new(ResultSlots {
        dependencies,
        values: explicit,
        sealed: false,
      })),
    }
  }

  /// Assigns the non-explicit dependency `name`.
  pub fn set(&self, name: &str, value: impl Into<Raw>) -> Result<()> {
    let mut slots = lock(&self.slots);
    if slots.sealed {
      return Err(Error::Redo(format!(
        "cannot assign {name:?}: result is read-only after the redo has completed"
      )));
    }
    let Some((_, dep)) = slots.dependencies.iter().find(|(n, _)| n == name) else {
      return Err(Error::Dependency(format!("not a dependency role of the tool: {name:?}")));
    };
    if dep.is_explicit() {
      return Err(Error::Redo(format!(
        "cannot assign explicit dependency {name:?}\n  | explicit dependencies are assigned when the tool instance is created"
      )));
    }
    if slots.values.contains_key(name) {
      return Err(Error::Redo(format!("non-explicit dependency already assigned: {name:?}")));
    }
    let concrete = dep
      .validate(value.into())
      .map_err(|e| Error::Dependency(format!("value for dependency role {name:?} is invalid: {dep}\n  | reason: {e}")))?;
    slots.values.insert(name.to_string(), concrete);
    Ok(())
  }

  /// Value of `name`; fails for a non-explicit dependency that is not assigned yet.
  pub fn get(&self, name: &str) -> Result<Concrete> {
    let slots = lock(&self.slots);
    if let Some(v) = slots.values.get(name) {
      return Ok(v.clone());
    }
    if slots.dependencies.iter().any(|(n, _)| n == name) {
      return Err(Error::Redo(format!("non-explicit dependency not assigned yet: {name:?}")));
    }
    Err(Error::Dependency(format!("not a dependency role of the tool: {name:?}")))
  }

  pub fn is_assigned(&self, name: &str) -> bool {
    lock(&self.slots).values.contains_key(name)
  }

  /// Assigns `Concrete::Absent` to an optional slot the redo left unassigned.
  pub(crate) fn assign_absent(&self, name: &str) {
    lock(&self.slots).values.entry(name.to_string()).or_default();
  }

  pub(crate) fn seal(&self) -> BTreeMap<String, Concrete> {
    let mut slots = lock(&self.slots);
    slots.sealed = true;
    slots.values.clone()
  }
}

/// Immutable result of one run of a tool instance.
#[derive(Debug, Clone)]
pub struct RunResult {
  tool: String,
  fingerprint: Fingerprint,
  redo: bool,
  values: BTreeMap<String, Concrete>,
}

impl RunResult {
  pub(crate) fn new(tool: String, fingerprint: Fingerprint, redo: bool, values: BTreeMap<String, Concrete>) -> Self {
    RunResult {
      tool,
      fingerprint,
      redo,
      values,
    }
  }

  /// Whether a redo was performed. A run without redo only carries the explicit dependencies.
  pub fn redo(&self) -> bool {
    self.redo
  }

  pub fn tool_name(&self) -> &str {
    &self.tool
  }

  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }

  pub fn get(&self, name: &str) -> Option<&Concrete> {
    self.values.get(name)
  }

  /// The single path of dependency `name`.
  pub fn path(&self, name: &str) -> Option<&Path> {
    self.get(name)?.single()?.as_path()
  }

  pub fn paths(&self, name: &str) -> Vec<&Path> {
    self.get(name).map(|c| c.paths().collect()).unwrap_or_default()
  }
}

pub(crate) enum ProxyState {
  Pending(TaskId),
  Ready(Result<Arc<RunResult>>),
}

/// Result of `ToolInstance::start()`.
///
/// The first [`complete`](Self::complete) of a pending redo waits for it; later accesses return
/// the same result (or error) without waiting.
pub struct ResultProxy {
  state: Rc<RefCell<ProxyState>>,
  root: Weak<Root>,
}

impl ResultProxy {
  pub(crate) fn ready(result: Arc<RunResult>) -> Self {
    ResultProxy {
      state: Rc::new(RefCell::new(ProxyState::Ready(Ok(result)))),
      root: Weak::new(),
    }
  }

  pub(crate) fn pending(state: Rc<RefCell<ProxyState>>, root: Weak<Root>) -> Self {
    ResultProxy { state, root }
  }

  /// True if the result is available without waiting. Never blocks.
  pub fn is_complete(&self) -> bool {
    match &*self.state.borrow() {
      ProxyState::Ready(_) => true,
      ProxyState::Pending(tid) => self.root.upgrade().is_some_and(|root| root.is_task_complete(*tid)),
    }
  }

  /// Whether a redo was started for this run. Never blocks.
  pub fn is_redo(&self) -> bool {
    match &*self.state.borrow() {
      ProxyState::Ready(Ok(r)) => r.redo(),
      _ => true,
    }
  }

  pub fn complete(&self) -> Result<Arc<RunResult>> {
    let tid = match &*self.state.borrow() {
      ProxyState::Ready(result) => return result.clone(),
      ProxyState::Pending(tid) => *tid,
    };
    let root = self
      .root
      .upgrade()
      .ok_or_else(|| Error::NotRunning("the context of this redo has exited".to_string()))?;
    root.consume_into_proxy(tid)?;
    match &*self.state.borrow() {
      ProxyState::Ready(result) => result.clone(),
      ProxyState::Pending(_) => Err(Error::NotRunning(format!("result of redo {tid} is not available"))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::depend::{input, output};

  fn result() -> RedoResult {
    let deps = Arc::new(vec![
      ("source_file".to_string(), input::regular_file()),
      ("object_file".to_string(), output::regular_file().explicit(false)),
      ("include_files".to_string(), input::regular_file().explicit(false).required(false)),
    ]);
    let explicit = BTreeMap::from([("source_file".to_string(), Concrete::One(crate::depend::Value::Path(Path::new("a.c").unwrap())))]);
    RedoResult::new(deps, explicit)
  }

  #[test]
  fn explicit_values_are_readable_and_not_assignable() {
    let r = result();
    assert!(r.get("source_file").is_ok());
    assert!(matches!(r.set("source_file", "b.c"), Err(Error::Redo(_))));
  }

  #[test]
  fn non_explicit_slot_is_write_once() {
    let r = result();
    assert!(matches!(r.get("object_file"), Err(Error::Redo(_))));
    r.set("object_file", "a.o").unwrap();
    assert!(r.is_assigned("object_file"));
    assert!(matches!(r.set("object_file", "b.o"), Err(Error::Redo(_))));
  }

  #[test]
  fn assignment_is_validated() {
    let r = result();
    assert!(matches!(r.set("object_file", "out/"), Err(Error::Dependency(_))));
    assert!(matches!(r.set("object_file", Raw::None), Err(Error::Dependency(_))));
    assert!(matches!(r.set("no_such_role", "x"), Err(Error::Dependency(_))));
  }

  #[test]
  fn sealed_result_is_read_only() {
    let r = result();
    let leaked = r.clone();
    r.assign_absent("include_files");
    let values = r.seal();
    assert_eq!(values["include_files"], Concrete::Absent);
    assert!(matches!(leaked.set("object_file", "a.o"), Err(Error::Redo(_))));
  }

  #[test]
  fn ready_proxy() {
    let fp = Fingerprint::from_bytes([0; 20]);
    let proxy = ResultProxy::ready(Arc::new(RunResult::new("t".into(), fp, false, BTreeMap::new())));
    assert!(proxy.is_complete());
    assert!(!proxy.is_redo());
    assert!(!proxy.complete().unwrap().redo());
  }
}
