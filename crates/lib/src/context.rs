//! Context lifecycle.
//!
//! A [`Context`] is a frame on a stack of contexts. The root frame owns the working tree: its
//! lock, run database, temporary area and the redo sequencer. Nested frames only carry their own
//! environment variables and helpers, which shadow the outer ones until the frame exits.
//!
//! ```ignore
//! let ctx = Context::enter(ContextOptions::default())?;
//! ctx.env().import_from_outer("LANG", "[a-z]{2}_[A-Z]{2}", "sv_SE")?;
//! {
//!   let inner = ctx.nested(ContextOptions { max_parallel_redo_count: Some(4), ..Default::default() })?;
//!   compile.start(&inner, false)?;
//!   inner.exit()?;
//! }
//! ctx.exit()?;
//! ```
//!
//! A context is bound to the thread that entered it. Only the innermost frame may be modified,
//! and every modification first completes all pending redos.

pub mod env;
pub mod helper;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, first_line};
use crate::fs::{Path, PathClass};
use crate::rundb::{RunDatabase, RunSummary};
use crate::sequence::{Sequencer, TaskId};
use crate::tool::{Fingerprint, lock_db};
use crate::toolrun::{ProxyState, ResultProxy, RunResult};
use crate::worktree::lock::WorkingTreeLock;
use crate::worktree::{Temporary, UniquePathProvider, WorkingTree, remove_filesystem_object};

use self::env::{EnvDict, EnvFrame};
use self::helper::{HelperDict, HelperResolver};

/// How long an abnormal exit waits for cancelled redos to stop.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);
const TIME_CHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Options of [`Context::enter`] and [`Context::nested`].
///
/// `None` means: the default for a root context, the value of the enclosing frame for a nested one.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
  /// Working tree root; must contain `.dlbroot`. Default: the process working directory. Root only.
  pub root_dir: Option<PathBuf>,
  pub path_class: Option<PathClass>,
  /// Default for a root context: 1.
  pub max_parallel_redo_count: Option<usize>,
  /// Find helpers in the executable search paths. Default for a root context: true.
  pub find_helpers: Option<bool>,
  /// Root only. Default: [`Config::default`].
  pub config: Option<Config>,
  /// Environment `import_from_outer()` reads in the root context. Default: the process
  /// environment. Root only.
  pub outer_env: Option<BTreeMap<String, String>>,
}

pub(crate) struct Frame {
  pub(crate) max_parallel_redo_count: usize,
  pub(crate) find_helpers: bool,
  pub(crate) path_class: PathClass,
  pub(crate) env: EnvFrame,
  pub(crate) helpers: BTreeMap<Path, Path>,
}

/// What a redo started in a frame sees of it.
pub(crate) struct FrameSnapshot {
  pub env: BTreeMap<String, String>,
  pub helpers: BTreeMap<Path, Path>,
  pub find_helpers: bool,
  pub path_class: PathClass,
  pub max_parallel_redo_count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RunStats {
  pub runs_without_redo: AtomicU64,
  pub redos: AtomicU64,
}

/// Resources of a root context, shared by all its frames.
pub(crate) struct Root {
  pub(crate) tree: Arc<WorkingTree>,
  lock: RefCell<Option<WorkingTreeLock>>,
  pub(crate) rundb: Arc<Mutex<RunDatabase>>,
  pub(crate) temp: Arc<UniquePathProvider>,
  sequencer: RefCell<Sequencer<Arc<RunResult>>>,
  proxies: RefCell<BTreeMap<TaskId, Rc<RefCell<ProxyState>>>>,
  pending_by_fingerprint: RefCell<BTreeMap<Fingerprint, TaskId>>,
  pub(crate) frames: RefCell<Vec<Frame>>,
  pub(crate) config: Config,
  pub(crate) stats: Arc<RunStats>,
  pub(crate) resolver: Arc<HelperResolver>,
  pub(crate) outer_env: BTreeMap<String, String>,
  start_time_ns: i64,
  started: Instant,
}

impl Root {
  fn open(options: ContextOptions) -> Result<(Root, usize)> {
    let config = options.config.unwrap_or_default();
    config.check()?;
    let max_parallel_redo_count = check_parallel_redo_count(options.max_parallel_redo_count.unwrap_or(1))?;

    let root_dir = match options.root_dir {
      Some(dir) => dir,
      None => std::env::current_dir()
        .map_err(|e| Error::management_tree("failed to get the current working directory", e))?,
    };
    let (root, root_path) = WorkingTree::locate(&root_dir)?;
    let path_class = options.path_class.unwrap_or_default();
    check_root_path(path_class, &root_path)?;

    let lock = WorkingTreeLock::acquire(&WorkingTree::management_dir_of(&root), &root)?;
    let tree = WorkingTree::prepare(root, root_path)?;
    let mut rundb = RunDatabase::open(tree.management_dir())?;
    let purged = rundb.purge_older_than(config.max_dependency_age)?;
    if purged > 0 {
      debug!(count = purged, "removed outdated runs");
    }
    let start_time_ns = tree.working_tree_time_ns()?;

    let outer_env = options.outer_env.unwrap_or_else(|| {
      std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
    });
    let resolver = HelperResolver::from_path_var(outer_env.get("PATH").map(String::as_str));

    let root = Root {
      temp: Arc::new(UniquePathProvider::new(tree.temporary_dir())),
      tree: Arc::new(tree),
      lock: RefCell::new(Some(lock)),
      rundb: Arc::new(Mutex::new(rundb)),
      sequencer: RefCell::new(Sequencer::new()?),
      proxies: RefCell::new(BTreeMap::new()),
      pending_by_fingerprint: RefCell::new(BTreeMap::new()),
      frames: RefCell::new(vec![Frame {
        max_parallel_redo_count,
        find_helpers: options.find_helpers.unwrap_or(true),
        path_class,
        env: EnvFrame::default(),
        helpers: BTreeMap::new(),
      }]),
      config,
      stats: Arc::new(RunStats::default()),
      resolver: Arc::new(resolver),
      outer_env,
      start_time_ns,
      started: Instant::now(),
    };
    Ok((root, max_parallel_redo_count))
  }

  pub(crate) fn submit<F>(self: &Rc<Self>, fingerprint: Fingerprint, max_count: usize, fut: F) -> Result<ResultProxy>
  where
    F: Future<Output = Result<Arc<RunResult>>> + Send + 'static,
  {
    let tid = self.sequencer.borrow_mut().submit(max_count, fut)?;
    let state = Rc::new(RefCell::new(ProxyState::Pending(tid)));
    self.proxies.borrow_mut().insert(tid, state.clone());
    self.pending_by_fingerprint.borrow_mut().insert(fingerprint, tid);
    Ok(ResultProxy::pending(state, Rc::downgrade(self)))
  }

  pub(crate) fn is_task_complete(&self, tid: TaskId) -> bool {
    self.sequencer.borrow().is_complete(tid)
  }

  /// Waits for the pending redo of the same tool instance, if any.
  pub(crate) fn wait_for_fingerprint(&self, fingerprint: &Fingerprint) -> Result<()> {
    let tid = self.pending_by_fingerprint.borrow().get(fingerprint).copied();
    if let Some(tid) = tid {
      debug!(tid, "waiting for pending redo of the same tool instance");
      self.sequencer.borrow_mut().complete(tid, None)?;
    }
    Ok(())
  }

  /// Waits for `tid` and hands its result to its proxy.
  pub(crate) fn consume_into_proxy(&self, tid: TaskId) -> Result<()> {
    let result = self.sequencer.borrow_mut().consume(tid)?;
    self.settle(tid, result);
    Ok(())
  }

  fn settle(&self, tid: TaskId, result: Result<Arc<RunResult>>) {
    self.pending_by_fingerprint.borrow_mut().retain(|_, t| *t != tid);
    if let Some(state) = self.proxies.borrow_mut().remove(&tid) {
      *state.borrow_mut() = ProxyState::Ready(result);
    }
  }

  /// Hands all completed results to their proxies; returns the error of the lowest task id.
  fn settle_completed(&self) -> Option<Error> {
    let results = self.sequencer.borrow_mut().consume_all();
    let mut first_error = None;
    for (tid, result) in results {
      if let Err(e) = &result
        && first_error.is_none()
      {
        first_error = Some(e.clone());
      }
      self.settle(tid, result);
    }
    first_error
  }

  /// Completes all pending redos and fails with the first redo error.
  fn drain(&self) -> Result<()> {
    let completed = self.sequencer.borrow_mut().complete_all(None);
    let first_error = self.settle_completed();
    completed?;
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn summary(&self) -> RunSummary {
    RunSummary {
      start_time_ns: self.start_time_ns,
      duration_ns: u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX),
      runs_without_redo: self.stats.runs_without_redo.load(Ordering::Relaxed),
      redos: self.stats.redos.load(Ordering::Relaxed),
    }
  }

  /// Cleanup of a successful exit. Every step runs; the first error is returned.
  fn close(&self) -> Result<()> {
    let mut first_error = self.drain().err();
    let mut keep = |r: Result<()>| {
      if let Err(e) = r
        && first_error.is_none()
      {
        first_error = Some(e);
      }
    };

    let summary = self.summary();
    keep(self.record_summary(summary));

    let temporary_dir = self.tree.temporary_dir();
    keep(
      remove_filesystem_object(&temporary_dir, None, true)
        .map_err(|e| Error::management_tree(format!("failed to clean up {}", temporary_dir.display()), e)),
    );

    keep(
      self
        .tree
        .working_tree_time_ns()
        .and_then(|t| self.tree.wait_for_time_after(t, TIME_CHANGE_TIMEOUT))
        .map(|_| ()),
    );

    if let Some(lock) = self.lock.borrow_mut().take() {
      keep(lock.release().map_err(Error::from));
    }
    info!(
      runs = summary.run_count(),
      redos = summary.redos,
      duration = %humantime::format_duration(round_to_millis(summary.duration())),
      "exited root context"
    );

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn record_summary(&self, summary: RunSummary) -> Result<()> {
    let mut db = lock_db(&self.rundb);
    db.purge_older_than(self.config.max_dependency_age)?;
    let max_count = self.config.latest_run_summary_max_count;
    if max_count > 0 {
      for previous in db.latest_run_summaries(max_count) {
        log_summary(&previous, false);
      }
      log_summary(&summary, true);
    }
    db.append_run_summary(summary, self.config.max_run_summary_count)?;
    Ok(())
  }

  /// Cleanup of an abnormal exit: pending redos are cancelled, no summary is written.
  fn abort(&self) {
    match self.sequencer.try_borrow_mut() {
      Ok(mut sequencer) => {
        if sequencer.pending_count() > 0 {
          warn!(count = sequencer.pending_count(), "cancelling pending redos");
        }
        if let Err(e) = sequencer.cancel_all(Some(CANCEL_TIMEOUT)) {
          warn!(error = %first_line(&e), "failed to cancel pending redos");
        }
      }
      Err(_) => warn!("cannot cancel pending redos while waiting for them"),
    }
    let _ = self.settle_completed();
    if let Some(lock) = self.lock.borrow_mut().take()
      && let Err(e) = lock.release()
    {
      warn!(error = %first_line(&e), "failed to release working tree lock");
    }
  }
}

fn log_summary(summary: &RunSummary, current: bool) {
  let start = UNIX_EPOCH + Duration::from_nanos(u64::try_from(summary.start_time_ns).unwrap_or_default());
  let redo_ratio = if summary.run_count() > 0 {
    100.0 * summary.redos as f64 / summary.run_count() as f64
  } else {
    0.0
  };
  info!(
    start = %humantime::format_rfc3339_millis(start),
    duration = %humantime::format_duration(round_to_millis(summary.duration())),
    runs = summary.run_count(),
    redos = summary.redos,
    redo_ratio = %format!("{redo_ratio:.1}%"),
    current,
    "run summary"
  );
}

fn round_to_millis(d: Duration) -> Duration {
  Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn check_parallel_redo_count(count: usize) -> Result<usize> {
  if count == 0 {
    return Err(Error::Config(
      "'max_parallel_redo_count' must be at least 1".to_string(),
    ));
  }
  Ok(count)
}

fn check_root_path(path_class: PathClass, root_path: &Path) -> Result<()> {
  path_class.check(root_path).map_err(|e| {
    Error::working_tree_path(format!(
      "working tree's root path violates path restrictions imposed by {path_class}\n  | reason: {e}"
    ))
  })
}

/// A frame of the context stack; see the module documentation.
pub struct Context {
  pub(crate) root: Rc<Root>,
  pub(crate) depth: usize,
  exited: bool,
}

impl Context {
  /// Enters a root context on the working tree at `options.root_dir`.
  pub fn enter(options: ContextOptions) -> Result<Context> {
    let (root, max_parallel_redo_count) = Root::open(options)?;
    info!(
      root = %root.tree.root().display(),
      max_parallel_redo_count,
      "entered root context"
    );
    Ok(Context {
      root: Rc::new(root),
      depth: 0,
      exited: false,
    })
  }

  /// Enters a context nested in this one, which must be the innermost.
  pub fn nested(&self, options: ContextOptions) -> Result<Context> {
    self.begin_modification("enter a nested context")?;
    if options.root_dir.is_some() || options.config.is_some() || options.outer_env.is_some() {
      return Err(Error::ContextNesting(
        "'root_dir', 'config' and 'outer_env' can only be set for a root context".to_string(),
      ));
    }

    let mut frames = self.root.frames.borrow_mut();
    let (root_max, root_find_helpers) = (frames[0].max_parallel_redo_count, frames[0].find_helpers);
    let parent = &frames[self.depth];

    let max_parallel_redo_count =
      check_parallel_redo_count(options.max_parallel_redo_count.unwrap_or(parent.max_parallel_redo_count))?;
    if max_parallel_redo_count > root_max {
      return Err(Error::ContextNesting(format!(
        "'max_parallel_redo_count' of a nested context must not exceed the root context's: {max_parallel_redo_count} > {root_max}"
      )));
    }
    let find_helpers = options.find_helpers.unwrap_or(parent.find_helpers);
    if find_helpers && !root_find_helpers {
      return Err(Error::ContextNesting(
        "'find_helpers' must be false if it is false for the root context".to_string(),
      ));
    }
    let path_class = options.path_class.unwrap_or(parent.path_class);
    if !path_class.is_subclass_of(parent.path_class) {
      return Err(Error::ContextNesting(format!(
        "path class of a nested context must be a subclass of the enclosing context's: {path_class} is not a subclass of {}",
        parent.path_class
      )));
    }
    check_root_path(path_class, self.root.tree.root_path())?;

    frames.push(Frame {
      max_parallel_redo_count,
      find_helpers,
      path_class,
      env: EnvFrame::default(),
      helpers: BTreeMap::new(),
    });
    debug!(depth = self.depth + 1, "entered nested context");
    Ok(Context {
      root: self.root.clone(),
      depth: self.depth + 1,
      exited: false,
    })
  }

  /// Exits the context. Pending redos are completed first; the first redo error is returned
  /// after the exit.
  pub fn exit(mut self) -> Result<()> {
    if !self.is_innermost() {
      return Err(Error::ContextNesting(
        "cannot exit a context that is not the innermost one\n  | exit the nested contexts first".to_string(),
      ));
    }
    self.exited = true;
    if self.depth > 0 {
      let drained = self.root.drain();
      self.root.frames.borrow_mut().truncate(self.depth);
      debug!(depth = self.depth, "exited nested context");
      return drained;
    }
    let closed = self.root.close();
    self.root.frames.borrow_mut().clear();
    closed
  }

  fn is_innermost(&self) -> bool {
    !self.exited && self.root.frames.borrow().len() == self.depth + 1
  }

  /// Checks that this is the innermost frame and completes all pending redos.
  pub(crate) fn begin_modification(&self, what: &str) -> Result<()> {
    if !self.is_innermost() {
      return Err(Error::ContextModification(format!(
        "cannot {what}: context is not the innermost active context\n  | only the innermost context can be modified"
      )));
    }
    self.root.drain()
  }

  /// The root resources, if this is the innermost frame.
  pub(crate) fn active_root(&self, what: &str) -> Result<Rc<Root>> {
    if !self.is_innermost() {
      return Err(Error::NotRunning(format!(
        "cannot {what}: context is not the innermost active context"
      )));
    }
    Ok(self.root.clone())
  }

  pub(crate) fn snapshot(&self) -> FrameSnapshot {
    let frames = self.root.frames.borrow();
    let chain = &frames[..=self.depth.min(frames.len().saturating_sub(1))];
    let env_chain: Vec<&EnvFrame> = chain.iter().map(|f| &f.env).collect();
    let mut helpers = BTreeMap::new();
    for frame in chain {
      helpers.extend(frame.helpers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    let innermost = &chain[chain.len() - 1];
    FrameSnapshot {
      env: env::effective_values(&env_chain),
      helpers,
      find_helpers: innermost.find_helpers,
      path_class: innermost.path_class,
      max_parallel_redo_count: innermost.max_parallel_redo_count,
    }
  }

  pub fn env(&self) -> EnvDict<'_> {
    EnvDict::new(self)
  }

  pub fn helper(&self) -> HelperDict<'_> {
    HelperDict::new(self)
  }

  pub fn root_path(&self) -> &Path {
    self.root.tree.root_path()
  }

  pub fn is_active(&self) -> bool {
    !self.exited && self.root.frames.borrow().len() > self.depth
  }

  pub fn max_parallel_redo_count(&self) -> usize {
    self.snapshot().max_parallel_redo_count
  }

  pub fn find_helpers(&self) -> bool {
    self.snapshot().find_helpers
  }

  pub fn path_class(&self) -> PathClass {
    self.snapshot().path_class
  }

  /// Creates a file or directory in the temporary area; removed when dropped.
  pub fn temporary(&self, suffix: &str, is_dir: bool) -> Result<Temporary> {
    if !self.is_innermost() {
      return Err(Error::ContextModification(
        "cannot create a temporary: context is not the innermost active context".to_string(),
      ));
    }
    Temporary::create(&self.root.temp, suffix, is_dir)
  }

  /// The managed tree path of `path`, checked against this context's path class.
  pub fn working_tree_path_of(&self, path: &Path, existing: bool, allow_temporary: bool) -> Result<Path> {
    let rel = self.root.tree.working_tree_path_of(path, existing, allow_temporary)?;
    self.path_class().check(&rel)?;
    Ok(rel)
  }

  /// Summaries of the latest root contexts on this working tree, oldest first.
  pub fn summary_of_latest_runs(&self, max_count: usize) -> Result<Vec<RunSummary>> {
    let root = self.active_root("read run summaries")?;
    let db = lock_db(&root.rundb);
    Ok(db.latest_run_summaries(max_count))
  }
}

impl Drop for Context {
  fn drop(&mut self) {
    if self.exited {
      return;
    }
    if self.depth == 0 {
      warn!("root context dropped without exit");
      self.root.abort();
      self.root.frames.borrow_mut().clear();
    } else {
      self.root.frames.borrow_mut().truncate(self.depth);
    }
  }
}
