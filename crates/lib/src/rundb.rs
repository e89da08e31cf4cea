//! Run database.
//!
//! Records, per tool instance fingerprint, what the last successful redo saw: memos of its input
//! filesystem objects, its outputs, the environment variable values and definition hashes it
//! depended on. A record only exists after a redo completed successfully.
//!
//! # Storage Layout
//!
//! ```text
//! .dlbroot/
//! └── runs-1.json     # RunDatabaseFile: records by fingerprint + run summaries
//! ```
//!
//! The file is loaded completely on open and rewritten as a whole on every change: written to a
//! temporary file in the same directory, synced, then renamed over the old one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path as NativePath, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fs::Path;
use crate::tool::Fingerprint;

/// Schema version, also encoded in the file name.
pub const RUN_DATABASE_VERSION: u32 = 1;

pub fn database_file_name() -> String {
  format!("runs-{RUN_DATABASE_VERSION}.json")
}

const REMOVE_HINT: &str = "  | if you suspect a bug, report it and remove the run database to start over";

#[derive(Debug, Clone, Error)]
pub enum RunDbError {
  #[error("failed to read run database: {path}\n  | reason: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: Arc<io::Error>,
  },

  #[error("run database is corrupt: {path}\n  | reason: {message}\n{REMOVE_HINT}")]
  Corrupt { path: PathBuf, message: String },

  #[error("unsupported run database version {version}: {path}\n{REMOVE_HINT}")]
  UnsupportedVersion { path: PathBuf, version: u32 },

  #[error("failed to write run database: {path}\n  | reason: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: Arc<io::Error>,
  },
}

/// What the last successful redo saw of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
  pub explicit: bool,
  /// Hex-encoded `FilesystemObjectMemo`, `None` if the state is not known.
  pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
  /// Managed tree paths of all filesystem inputs.
  pub inputs: BTreeMap<Path, InputRecord>,
  /// Managed tree paths of all filesystem outputs.
  pub outputs: BTreeSet<Path>,
  /// Values of the environment variables the redo depended on, by name.
  pub env: BTreeMap<String, String>,
  /// Hashes of the tool definitions by definition key.
  pub definitions: BTreeMap<String, String>,
  pub parameters_digest: String,
  /// The last redo asked for another redo at the next run.
  pub redo_requested: bool,
  /// Unix timestamp (seconds) of the redo that wrote this record.
  pub updated_at: u64,
}

impl RunRecord {
  pub fn new() -> Self {
    RunRecord {
      inputs: BTreeMap::new(),
      outputs: BTreeSet::new(),
      env: BTreeMap::new(),
      definitions: BTreeMap::new(),
      parameters_digest: String::new(),
      redo_requested: false,
      updated_at: unix_now(),
    }
  }
}

impl Default for RunRecord {
  fn default() -> Self {
    Self::new()
  }
}

/// Statistics of one root context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
  /// Working tree time at root entry.
  pub start_time_ns: i64,
  pub duration_ns: u64,
  pub runs_without_redo: u64,
  pub redos: u64,
}

impl RunSummary {
  pub fn duration(&self) -> Duration {
    Duration::from_nanos(self.duration_ns)
  }

  pub fn run_count(&self) -> u64 {
    self.runs_without_redo + self.redos
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunDatabaseFile {
  version: u32,
  records: BTreeMap<String, RunRecord>,
  #[serde(default)]
  summaries: Vec<RunSummary>,
}

impl RunDatabaseFile {
  fn new() -> Self {
    RunDatabaseFile {
      version: RUN_DATABASE_VERSION,
      records: BTreeMap::new(),
      summaries: Vec::new(),
    }
  }
}

#[derive(Debug)]
pub struct RunDatabase {
  path: PathBuf,
  data: RunDatabaseFile,
}

impl RunDatabase {
  /// Opens the run database in `management_dir`, creating it if it does not exist.
  ///
  /// A corrupt file or one with another schema version is an error; it is never replaced.
  pub fn open(management_dir: &NativePath) -> Result<Self, RunDbError> {
    let path = management_dir.join(database_file_name());

    let content = match fs::read_to_string(&path) {
      Ok(content) => Some(content),
      Err(e) if e.kind() == io::ErrorKind::NotFound => None,
      Err(e) => {
        return Err(RunDbError::Read {
          path,
          source: Arc::new(e),
        });
      }
    };

    let Some(content) = content else {
      let db = RunDatabase {
        path,
        data: RunDatabaseFile::new(),
      };
      db.save(&db.data)?;
      debug!(path = %db.path.display(), "created run database");
      return Ok(db);
    };

    // Check the version before the schema so that a future layout is reported as such.
    let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| RunDbError::Corrupt {
      path: path.clone(),
      message: e.to_string(),
    })?;
    if let Some(version) = raw.get("version").and_then(serde_json::Value::as_u64)
      && version != u64::from(RUN_DATABASE_VERSION)
    {
      return Err(RunDbError::UnsupportedVersion {
        path,
        version: u32::try_from(version).unwrap_or(u32::MAX),
      });
    }
    let data: RunDatabaseFile = serde_json::from_value(raw).map_err(|e| RunDbError::Corrupt {
      path: path.clone(),
      message: e.to_string(),
    })?;

    debug!(path = %path.display(), records = data.records.len(), "opened run database");
    Ok(RunDatabase { path, data })
  }

  pub fn path(&self) -> &NativePath {
    &self.path
  }

  pub fn len(&self) -> usize {
    self.data.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.records.is_empty()
  }

  pub fn get(&self, fingerprint: &Fingerprint) -> Option<&RunRecord> {
    self.data.records.get(&fingerprint.to_string())
  }

  /// Replaces the record of `fingerprint` with one durable write.
  pub fn put(&mut self, fingerprint: &Fingerprint, record: RunRecord) -> Result<(), RunDbError> {
    self.update(|data| {
      data.records.insert(fingerprint.to_string(), record);
    })
  }

  pub fn remove(&mut self, fingerprint: &Fingerprint) -> Result<bool, RunDbError> {
    if !self.data.records.contains_key(&fingerprint.to_string()) {
      return Ok(false);
    }
    self.update(|data| {
      data.records.remove(&fingerprint.to_string());
    })?;
    Ok(true)
  }

  /// Removes all records last updated more than `max_age` ago. Returns the number removed.
  pub fn purge_older_than(&mut self, max_age: Duration) -> Result<usize, RunDbError> {
    let limit = unix_now().saturating_sub(max_age.as_secs());
    let stale = self.data.records.values().filter(|r| r.updated_at < limit).count();
    if stale == 0 {
      return Ok(0);
    }
    self.update(|data| data.records.retain(|_, r| r.updated_at >= limit))?;
    debug!(removed = stale, "purged stale run records");
    Ok(stale)
  }

  /// Forgets the memos of all inputs at or below one of `modified` in records other than
  /// `except`, so that the next run of their tool instances redoes.
  ///
  /// Does not write; the change is persisted with the next `put`.
  pub fn invalidate_inputs_under(&mut self, modified: &BTreeSet<Path>, except: &Fingerprint) -> usize {
    if modified.is_empty() {
      return 0;
    }
    let except = except.to_string();
    let mut count = 0;
    for (fp, record) in self.data.records.iter_mut() {
      if *fp == except {
        continue;
      }
      for (path, input) in record.inputs.iter_mut() {
        if input.memo.is_some() && modified.iter().any(|m| path.components().starts_with(m.components())) {
          input.memo = None;
          count += 1;
        }
      }
    }
    count
  }

  /// Appends a summary and keeps at most `max_count` of them.
  pub fn append_run_summary(&mut self, summary: RunSummary, max_count: usize) -> Result<(), RunDbError> {
    self.update(|data| {
      data.summaries.push(summary);
      let excess = data.summaries.len().saturating_sub(max_count);
      data.summaries.drain(..excess);
    })
  }

  /// The latest `max_count` summaries, oldest first.
  pub fn latest_run_summaries(&self, max_count: usize) -> Vec<RunSummary> {
    let start = self.data.summaries.len().saturating_sub(max_count);
    self.data.summaries[start..].to_vec()
  }

  fn update(&mut self, change: impl FnOnce(&mut RunDatabaseFile)) -> Result<(), RunDbError> {
    let mut next = self.data.clone();
    change(&mut next);
    self.save(&next)?;
    self.data = next;
    Ok(())
  }

  /// Atomic write: temporary file in the same directory, fsync, rename.
  fn save(&self, data: &RunDatabaseFile) -> Result<(), RunDbError> {
    let write_err = |e: io::Error| RunDbError::Write {
      path: self.path.clone(),
      source: Arc::new(e),
    };
    let dir = self.path.parent().unwrap_or(NativePath::new("."));
    let content = serde_json::to_vec(data).map_err(|e| write_err(io::Error::other(e)))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(&content).map_err(write_err)?;
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(&self.path).map_err(|e| write_err(e.error))?;
    Ok(())
  }
}

pub(crate) fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn fp(b: u8) -> Fingerprint {
    Fingerprint::from_bytes([b; 20])
  }

  fn p(s: &str) -> Path {
    Path::new(s).unwrap()
  }

  fn record_with_input(path: &str, memo: &str) -> RunRecord {
    let mut r = RunRecord::new();
    r.inputs.insert(
      p(path),
      InputRecord {
        explicit: false,
        memo: Some(memo.to_string()),
      },
    );
    r
  }

  #[test]
  fn open_creates_file_when_missing() {
    let temp = TempDir::new().unwrap();
    let db = RunDatabase::open(temp.path()).unwrap();
    assert!(db.is_empty());
    assert!(temp.path().join("runs-1.json").exists());
  }

  #[test]
  fn records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let mut db = RunDatabase::open(temp.path()).unwrap();
    let record = record_with_input("src/a.cpp", "0100");
    db.put(&fp(1), record.clone()).unwrap();

    let db = RunDatabase::open(temp.path()).unwrap();
    assert_eq!(db.get(&fp(1)), Some(&record));
    assert_eq!(db.get(&fp(2)), None);
  }

  #[test]
  fn remove_record() {
    let temp = TempDir::new().unwrap();
    let mut db = RunDatabase::open(temp.path()).unwrap();
    db.put(&fp(1), RunRecord::new()).unwrap();
    assert!(db.remove(&fp(1)).unwrap());
    assert!(!db.remove(&fp(1)).unwrap());
    assert!(RunDatabase::open(temp.path()).unwrap().is_empty());
  }

  #[test]
  fn purge_removes_only_old_records() {
    let temp = TempDir::new().unwrap();
    let mut db = RunDatabase::open(temp.path()).unwrap();
    let mut old = RunRecord::new();
    old.updated_at = unix_now() - 3600;
    db.put(&fp(1), old).unwrap();
    db.put(&fp(2), RunRecord::new()).unwrap();

    assert_eq!(db.purge_older_than(Duration::from_secs(60)).unwrap(), 1);
    assert!(db.get(&fp(1)).is_none());
    assert!(db.get(&fp(2)).is_some());
  }

  #[test]
  fn invalidate_inputs_under_modified_outputs() {
    let temp = TempDir::new().unwrap();
    let mut db = RunDatabase::open(temp.path()).unwrap();
    db.put(&fp(1), record_with_input("out/gen/a.h", "01")).unwrap();
    db.put(&fp(2), record_with_input("out/gen/b.h", "01")).unwrap();
    db.put(&fp(3), record_with_input("src/c.h", "01")).unwrap();

    let modified = BTreeSet::from([p("out/gen/")]);
    assert_eq!(db.invalidate_inputs_under(&modified, &fp(2)), 1);
    assert_eq!(db.get(&fp(1)).unwrap().inputs[&p("out/gen/a.h")].memo, None);
    assert!(db.get(&fp(2)).unwrap().inputs[&p("out/gen/b.h")].memo.is_some());
    assert!(db.get(&fp(3)).unwrap().inputs[&p("src/c.h")].memo.is_some());
  }

  #[test]
  fn summaries_are_bounded() {
    let temp = TempDir::new().unwrap();
    let mut db = RunDatabase::open(temp.path()).unwrap();
    for i in 0..5 {
      let summary = RunSummary {
        start_time_ns: i,
        duration_ns: 10,
        runs_without_redo: 1,
        redos: 2,
      };
      db.append_run_summary(summary, 3).unwrap();
    }
    let all = db.latest_run_summaries(10);
    assert_eq!(all.iter().map(|s| s.start_time_ns).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_eq!(db.latest_run_summaries(1)[0].start_time_ns, 4);
    assert_eq!(all[0].run_count(), 3);
  }

  // Corrupt database handling tests

  #[test]
  fn open_handles_corrupted_json() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("runs-1.json"), "not valid json {{{").unwrap();
    let result = RunDatabase::open(temp.path());
    assert!(matches!(result, Err(RunDbError::Corrupt { .. })));
  }

  #[test]
  fn open_handles_wrong_schema() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("runs-1.json"), r#"{"foo": "bar"}"#).unwrap();
    assert!(matches!(RunDatabase::open(temp.path()), Err(RunDbError::Corrupt { .. })));
  }

  #[test]
  fn open_handles_empty_file() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("runs-1.json"), "").unwrap();
    assert!(RunDatabase::open(temp.path()).is_err());
  }

  #[test]
  fn open_handles_unsupported_version() {
    let temp = TempDir::new().unwrap();
    fs::write(
      temp.path().join("runs-1.json"),
      r#"{"version": 99999, "records": {}, "summaries": []}"#,
    )
    .unwrap();
    let result = RunDatabase::open(temp.path());
    assert!(matches!(result, Err(RunDbError::UnsupportedVersion { version: 99999, .. })));
  }

  #[test]
  fn corrupt_file_is_not_replaced() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("runs-1.json");
    fs::write(&file, "[]").unwrap();
    let err = RunDatabase::open(temp.path()).unwrap_err();
    assert!(err.to_string().contains("remove the run database"));
    assert_eq!(fs::read_to_string(&file).unwrap(), "[]");
  }
}
