//! File-based working tree locking for mutual exclusion.
//!
//! At most one root context may be active on a working tree. The lock is an advisory exclusive
//! lock on `.dlbroot/lock`, held for the lifetime of [`WorkingTreeLock`]; the operating system
//! releases it when the process dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOCK_FILENAME: &str = "lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub root: PathBuf,
}

#[derive(Debug, Clone, Error)]
pub enum LockError {
  #[error(
    "working tree is locked by another process (PID {pid}, started {started_at})\n  \
     | if you are sure no dlb process is running on this working tree, remove the lock file:\n  \
     | {lock_path}"
  )]
  Contention {
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "working tree is locked (could not read lock metadata)\n  \
     | if you are sure no dlb process is running on this working tree, remove the lock file:\n  \
     | {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] Arc<io::Error>),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] Arc<io::Error>),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] Arc<io::Error>),
}

pub struct WorkingTreeLock {
  file: File,
  lock_path: PathBuf,
}

impl WorkingTreeLock {
  /// Acquires the exclusive lock in `management_dir` without waiting.
  pub fn acquire(management_dir: &Path, root: &Path) -> Result<Self, LockError> {
    let lock_path = management_dir.join(LOCK_FILENAME);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|e| LockError::OpenFile(Arc::new(e)))?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(Self::read_contention_error(&lock_path));
      }
      return Err(LockError::LockFailed(Arc::new(err)));
    }

    Self::write_metadata(&file, root)?;
    Ok(WorkingTreeLock { file, lock_path })
  }

  /// Reads the lock metadata from the held file handle.
  ///
  /// Opening a new handle would fail on Windows due to mandatory locking.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn write_metadata(file: &File, root: &Path) -> Result<(), LockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      root: root.to_path_buf(),
    };

    let write_err = |e: io::Error| LockError::WriteMetadata(Arc::new(e));
    file.set_len(0).map_err(write_err)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| write_err(io::Error::other(e)))?;
    writer.flush().map_err(write_err)?;

    Ok(())
  }

  fn read_contention_error(lock_path: &Path) -> LockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok()
        && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
      {
        let started_at = humantime::format_rfc3339_seconds(UNIX_EPOCH + std::time::Duration::from_secs(metadata.started_at_unix));
        return LockError::Contention {
          pid: metadata.pid,
          started_at: started_at.to_string(),
          lock_path: lock_path.to_path_buf(),
        };
      }
    }

    LockError::ContentionUnknown {
      lock_path: lock_path.to_path_buf(),
    }
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  /// Releases the lock. Dropping has the same effect but cannot report errors.
  pub fn release(self) -> Result<(), LockError> {
    unlock(&self.file).map_err(|e| LockError::LockFailed(Arc::new(e)))
  }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::Unlock).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result == 0 {
    let err = io::Error::last_os_error();
    // ERROR_LOCK_VIOLATION
    if err.raw_os_error() == Some(33) {
      return Err(io::Error::new(io::ErrorKind::WouldBlock, err));
    }
    Err(err)
  } else {
    Ok(())
  }
}

#[cfg(windows)]
fn unlock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: see `try_lock`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    UnlockFileEx(handle, 0, 1, 0, &mut overlapped)
  };

  if result == 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}
