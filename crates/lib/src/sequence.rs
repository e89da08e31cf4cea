//! Bounded-concurrency sequencer for redo tasks.
//!
//! A [`Sequencer`] owns a current-thread tokio runtime. Submitted futures are spawned on it and
//! make progress only while the owner blocks in one of the methods below, so the owner decides
//! when redos run: the moment it next waits for the sequencer.
//!
//! Each task is in exactly one of two maps: `pending` (spawned, result not yet collected) or
//! `done` (result collected, not yet consumed).

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use crate::error::Error;

pub type TaskId = u64;

#[derive(Debug, Clone, Error)]
pub enum SequencerError {
  #[error("timeout after {0:?} while waiting for pending redos")]
  Timeout(Duration),

  #[error("nothing to consume for task {0}\n  | the result of a task can be consumed only once")]
  NothingToConsume(TaskId),

  #[error("unknown task {0}")]
  UnknownTask(TaskId),

  #[error("cannot wait for redos from inside a running redo\n  | a redo must not use its context")]
  Reentrant,

  #[error("failed to start redo runtime: {0}")]
  Runtime(#[source] Arc<io::Error>),
}

/// Decrements the running count and wakes a waiting submitter when a task ends, however it ends.
struct RunningGuard {
  running: Arc<AtomicUsize>,
  slot_freed: Arc<Notify>,
}

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.running.fetch_sub(1, Ordering::SeqCst);
    self.slot_freed.notify_one();
  }
}

pub struct Sequencer<T> {
  runtime: Runtime,
  next_tid: TaskId,
  pending: BTreeMap<TaskId, JoinHandle<Result<T, Error>>>,
  done: BTreeMap<TaskId, Result<T, Error>>,
  running: Arc<AtomicUsize>,
  slot_freed: Arc<Notify>,
}

impl<T: Send + 'static> Sequencer<T> {
  pub fn new() -> Result<Self, SequencerError> {
    let runtime = Builder::new_current_thread()
      .enable_all()
      .build()
      .map_err(|e| SequencerError::Runtime(Arc::new(e)))?;
    Ok(Sequencer {
      runtime,
      next_tid: 0,
      pending: BTreeMap::new(),
      done: BTreeMap::new(),
      running: Arc::new(AtomicUsize::new(0)),
      slot_freed: Arc::new(Notify::new()),
    })
  }

  /// Spawns `fut` and returns its task id.
  ///
  /// Blocks while `max_count` or more tasks are running. Running tasks make progress meanwhile.
  pub fn submit<F>(&mut self, max_count: usize, fut: F) -> Result<TaskId, SequencerError>
  where
    F: Future<Output = Result<T, Error>> + Send + 'static,
  {
    check_not_reentrant()?;
    let max_count = max_count.max(1);
    while self.running.load(Ordering::SeqCst) >= max_count {
      let slot_freed = self.slot_freed.clone();
      self.runtime.block_on(async move { slot_freed.notified().await });
    }

    let tid = self.next_tid;
    self.next_tid += 1;

    self.running.fetch_add(1, Ordering::SeqCst);
    let guard = RunningGuard {
      running: self.running.clone(),
      slot_freed: self.slot_freed.clone(),
    };
    let handle = self.runtime.spawn(async move {
      let _guard = guard;
      fut.await
    });
    self.pending.insert(tid, handle);
    debug!(tid, running = self.running.load(Ordering::SeqCst), "submitted task");
    Ok(tid)
  }

  pub fn running_count(&self) -> usize {
    self.running.load(Ordering::SeqCst)
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  /// True if the result of `tid` is available without waiting (or was already consumed).
  pub fn is_complete(&self, tid: TaskId) -> bool {
    match self.pending.get(&tid) {
      Some(handle) => handle.is_finished(),
      None => tid < self.next_tid,
    }
  }

  /// Waits for task `tid` to complete; its result is kept until consumed.
  pub fn complete(&mut self, tid: TaskId, timeout: Option<Duration>) -> Result<(), SequencerError> {
    check_not_reentrant()?;
    let Some(handle) = self.pending.get_mut(&tid) else {
      return if tid < self.next_tid {
        Ok(())
      } else {
        Err(SequencerError::UnknownTask(tid))
      };
    };

    let joined = match timeout {
      Some(timeout) => self
        .runtime
        .block_on(tokio::time::timeout(timeout, handle))
        .map_err(|_| SequencerError::Timeout(timeout))?,
      None => self.runtime.block_on(handle),
    };

    self.pending.remove(&tid);
    self.done.insert(tid, task_result(tid, joined));
    Ok(())
  }

  /// Waits for all pending tasks. On timeout, results of tasks completed so far are kept.
  pub fn complete_all(&mut self, timeout: Option<Duration>) -> Result<(), SequencerError> {
    check_not_reentrant()?;
    let deadline = timeout.map(|t| (Instant::now() + t, t));
    let tids: Vec<TaskId> = self.pending.keys().copied().collect();
    for tid in tids {
      let remaining = match deadline {
        Some((deadline, t)) => {
          let remaining = deadline.saturating_duration_since(Instant::now());
          if remaining.is_zero() && !self.is_complete(tid) {
            return Err(SequencerError::Timeout(t));
          }
          Some(remaining)
        }
        None => None,
      };
      self.complete(tid, remaining).map_err(|e| match (e, deadline) {
        (SequencerError::Timeout(_), Some((_, t))) => SequencerError::Timeout(t),
        (e, _) => e,
      })?;
    }
    Ok(())
  }

  /// Cancels all pending tasks and waits for them to stop.
  ///
  /// A task that completed before it was cancelled keeps its result; the others complete with
  /// [`Error::Cancelled`].
  pub fn cancel_all(&mut self, timeout: Option<Duration>) -> Result<(), SequencerError> {
    check_not_reentrant()?;
    if self.pending.is_empty() {
      return Ok(());
    }
    debug!(count = self.pending.len(), "cancelling pending tasks");
    for handle in self.pending.values() {
      handle.abort();
    }
    self.complete_all(timeout)
  }

  /// Removes and returns the result of `tid`, waiting for it if necessary.
  pub fn consume(&mut self, tid: TaskId) -> Result<Result<T, Error>, SequencerError> {
    if self.pending.contains_key(&tid) {
      self.complete(tid, None)?;
    }
    self.done.remove(&tid).ok_or(SequencerError::NothingToConsume(tid))
  }

  /// Removes and returns the results of all completed tasks, by task id.
  pub fn consume_all(&mut self) -> BTreeMap<TaskId, Result<T, Error>> {
    std::mem::take(&mut self.done)
  }
}

fn check_not_reentrant() -> Result<(), SequencerError> {
  if tokio::runtime::Handle::try_current().is_ok() {
    return Err(SequencerError::Reentrant);
  }
  Ok(())
}

fn task_result<T>(tid: TaskId, joined: Result<Result<T, Error>, JoinError>) -> Result<T, Error> {
  match joined {
    Ok(result) => result,
    Err(e) if e.is_cancelled() => {
      debug!(tid, "task cancelled");
      Err(Error::Cancelled)
    }
    Err(e) => {
      let payload = e.into_panic();
      let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      error!(tid, panic = %message, "task panicked");
      Err(Error::Panicked(message))
    }
  }
}
