//! Error type shared by all public operations.
//!
//! Every message starts with a one-line cause. Where a corrective action exists, it follows on
//! separate lines of the form `  | hint`.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::fs::PathError;
use crate::mult::MultiplicityError;
use crate::rundb::RunDbError;
use crate::sequence::SequencerError;
use crate::worktree::lock::LockError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to build scripts.
///
/// `Error` is `Clone` because the error of a failed redo is stored in its result proxy and handed
/// out to every caller that accesses the proxy.
#[derive(Debug, Clone, Error)]
pub enum Error {
  /// The root directory of a context does not contain a management tree.
  #[error("{0}")]
  NoWorkingTree(String),

  /// The management tree could not be set up, used or cleaned up.
  #[error("{message}")]
  ManagementTree {
    message: String,
    #[source]
    source: Option<Arc<io::Error>>,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  RunDatabase(#[from] RunDbError),

  #[error("{0}")]
  WorkingTreeTime(String),

  /// Invalid configuration value.
  #[error("{0}")]
  Config(String),

  /// An operation needs a context that is no longer (or not yet) on the stack.
  #[error("{0}")]
  NotRunning(String),

  #[error("{0}")]
  ContextNesting(String),

  #[error("{0}")]
  ContextModification(String),

  #[error("{message}")]
  WorkingTreePath {
    message: String,
    #[source]
    source: Option<Arc<io::Error>>,
  },

  #[error(transparent)]
  Path(#[from] PathError),

  #[error(transparent)]
  Multiplicity(#[from] MultiplicityError),

  #[error("{0}")]
  DefinitionAmbiguity(String),

  /// Bad declaration or bad value of a dependency.
  #[error("{0}")]
  Dependency(String),

  #[error("{0}")]
  ExecutionParameter(String),

  #[error("{0}")]
  EnvVar(String),

  #[error("{0}")]
  Helper(String),

  /// A redo violated its dependency contract.
  #[error("{0}")]
  Redo(String),

  #[error("{message}")]
  HelperExecution {
    message: String,
    #[source]
    source: Option<Arc<io::Error>>,
  },

  #[error(transparent)]
  Sequencer(#[from] SequencerError),

  #[error("redo was cancelled")]
  Cancelled,

  #[error("redo panicked: {0}")]
  Panicked(String),
}

impl Error {
  pub(crate) fn management_tree(message: impl Into<String>, source: io::Error) -> Self {
    Error::ManagementTree {
      message: message.into(),
      source: Some(Arc::new(source)),
    }
  }

  pub(crate) fn working_tree_path(message: impl Into<String>) -> Self {
    Error::WorkingTreePath {
      message: message.into(),
      source: None,
    }
  }

  /// The I/O error that caused a working tree path to be rejected, if any.
  pub fn io_source(&self) -> Option<&io::Error> {
    match self {
      Error::ManagementTree { source, .. }
      | Error::WorkingTreePath { source, .. }
      | Error::HelperExecution { source, .. } => source.as_deref(),
      _ => None,
    }
  }
}

/// First line of an error message, for embedding in `  | reason: ...` lines.
pub(crate) fn first_line(e: &dyn std::fmt::Display) -> String {
  let s = e.to_string();
  s.lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_source_is_kept_for_management_tree_errors() {
    let e = Error::management_tree(
      "failed to set up management tree",
      io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
    );
    assert_eq!(e.io_source().map(|e| e.kind()), Some(io::ErrorKind::PermissionDenied));
    assert_eq!(e.to_string(), "failed to set up management tree");
  }

  #[test]
  fn first_line_drops_hints() {
    let e = Error::EnvVar("not declared: 'CC'\n  | use 'import_from_outer()' first".to_string());
    assert_eq!(first_line(&e), "not declared: 'CC'");
  }

  #[test]
  fn errors_are_clone() {
    let e = Error::Redo("x".into());
    let c = e.clone();
    assert_eq!(e.to_string(), c.to_string());
  }
}
