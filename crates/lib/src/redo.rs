//! Redo decision: is the state recorded by the last successful redo still current?

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::fs::Path;
use crate::memo::{FilesystemObjectMemo, MemoChange, compare_to_recorded};
use crate::rundb::RunRecord;

/// Live state of an explicit output before a redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
  Present,
  Missing,
  /// Exists but is not of the declared kind; removed before the redo.
  Obstructed,
}

/// Live memo of a recorded non-explicit input.
pub type LiveMemo = Result<FilesystemObjectMemo, String>;

/// Why a redo is necessary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoReason {
  Forced,
  NotRunBefore,
  OutputMissing(Path),
  OutputObstructed(Path),
  InputNonExistent(Path),
  InputInaccessible { path: Path, reason: String },
  InputChanged { path: Path, change: MemoChange },
  NewExplicitInput(Path),
  DefinitionChanged,
  RequestedByLastRedo,
  ExecutionParameterChanged,
  EnvVarChanged(String),
}

impl fmt::Display for RedoReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RedoReason::Forced => f.write_str("redo requested by start()"),
      RedoReason::NotRunBefore => f.write_str("redo necessary because not run before"),
      RedoReason::OutputMissing(p) => {
        write!(f, "redo necessary because of non-existent output dependency: {:?}", p.as_string())
      }
      RedoReason::OutputObstructed(p) => write!(
        f,
        "redo necessary because of output dependency of wrong type: {:?}",
        p.as_string()
      ),
      RedoReason::InputNonExistent(p) => write!(
        f,
        "redo necessary because of non-existent filesystem object: {:?}",
        p.as_string()
      ),
      RedoReason::InputInaccessible { path, reason } => write!(
        f,
        "redo necessary because of inaccessible filesystem object: {:?}\n    reason: {reason}",
        path.as_string()
      ),
      RedoReason::InputChanged { path, change } => write!(
        f,
        "redo necessary because of filesystem object: {:?}\n    reason: {change}",
        path.as_string()
      ),
      RedoReason::NewExplicitInput(p) => write!(
        f,
        "redo necessary because of new explicit input dependency: {:?}",
        p.as_string()
      ),
      RedoReason::DefinitionChanged => f.write_str("redo necessary because of changed tool definition"),
      RedoReason::RequestedByLastRedo => f.write_str("redo requested by last successful redo"),
      RedoReason::ExecutionParameterChanged => {
        f.write_str("redo necessary because of changed execution parameter")
      }
      RedoReason::EnvVarChanged(name) => write!(
        f,
        "redo necessary because of changed environment variable: {name:?}"
      ),
    }
  }
}

/// Everything the decision looks at. All paths are managed tree paths.
#[derive(Debug)]
pub struct RedoCheck<'a> {
  pub force: bool,
  pub record: Option<&'a RunRecord>,
  pub explicit_outputs: &'a BTreeMap<Path, OutputState>,
  pub explicit_inputs: &'a BTreeMap<Path, FilesystemObjectMemo>,
  pub recorded_non_explicit_inputs: &'a BTreeMap<Path, LiveMemo>,
  pub definitions: &'a BTreeMap<String, String>,
  pub parameters_digest: &'a str,
  pub env: &'a BTreeMap<String, String>,
}

/// Returns the first reason for a redo, or `None` if the recorded state is current.
pub fn decide(check: &RedoCheck<'_>) -> Option<RedoReason> {
  if check.force {
    return Some(RedoReason::Forced);
  }
  let Some(record) = check.record else {
    return Some(RedoReason::NotRunBefore);
  };

  for (path, state) in check.explicit_outputs {
    match state {
      OutputState::Present => {}
      OutputState::Missing => return Some(RedoReason::OutputMissing(path.clone())),
      OutputState::Obstructed => return Some(RedoReason::OutputObstructed(path.clone())),
    }
  }

  for (path, recorded) in &record.inputs {
    debug!(path = %path, explicit = recorded.explicit, "checking recorded input");
    if let Some(memo) = check.explicit_inputs.get(path) {
      if let Some(change) = compare_to_recorded(memo, recorded.memo.as_deref(), true) {
        return Some(RedoReason::InputChanged {
          path: path.clone(),
          change,
        });
      }
      continue;
    }
    if recorded.explicit {
      // no longer an explicit input of this instance
      continue;
    }

    match check.recorded_non_explicit_inputs.get(path) {
      None => return Some(RedoReason::InputNonExistent(path.clone())),
      Some(Err(reason)) => {
        return Some(RedoReason::InputInaccessible {
          path: path.clone(),
          reason: reason.clone(),
        });
      }
      Some(Ok(memo)) if !memo.exists() => {
        let recorded_as_absent = recorded
          .memo
          .as_deref()
          .and_then(|m| FilesystemObjectMemo::decode_hex(m).ok())
          .is_some_and(|m| !m.exists());
        if !recorded_as_absent {
          return Some(RedoReason::InputNonExistent(path.clone()));
        }
      }
      Some(Ok(memo)) => {
        if let Some(change) = compare_to_recorded(memo, recorded.memo.as_deref(), false) {
          return Some(RedoReason::InputChanged {
            path: path.clone(),
            change,
          });
        }
      }
    }
  }

  if let Some(path) = check.explicit_inputs.keys().find(|p| !record.inputs.contains_key(*p)) {
    return Some(RedoReason::NewExplicitInput(path.clone()));
  }

  if *check.definitions != record.definitions {
    return Some(RedoReason::DefinitionChanged);
  }
  if record.redo_requested {
    return Some(RedoReason::RequestedByLastRedo);
  }
  if check.parameters_digest != record.parameters_digest {
    return Some(RedoReason::ExecutionParameterChanged);
  }
  if *check.env != record.env {
    let changed = check
      .env
      .keys()
      .chain(record.env.keys())
      .find(|name| check.env.get(*name) != record.env.get(*name))
      .cloned()
      .unwrap_or_default();
    return Some(RedoReason::EnvVarChanged(changed));
  }
  None
}
