//! Filesystem object memos.
//!
//! A memo summarizes the observed state of a filesystem object: its `lstat` fields and, for
//! a symbolic link, its target. Two equal memos mean "probably unchanged".
//!
//! # Encoding
//!
//! Memos are stored in the run database as a versioned binary record, hex-encoded:
//!
//! ```text
//! u8   version (1)
//! u8   flags: bit 0 = stat present, bit 1 = symlink target present
//! [stat]   u32 mode, u64 size, i64 mtime_ns, u32 uid, u32 gid   (little endian)
//! [target] u32 length, UTF-8 bytes
//! ```
//!
//! A record with another version or trailing bytes does not decode; the state it describes is
//! then unknown.

use std::fmt;
use std::io;

use thiserror::Error;

pub const MEMO_ENCODING_VERSION: u8 = 1;

const FLAG_STAT: u8 = 0b01;
const FLAG_SYMLINK_TARGET: u8 = 0b10;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoEncodeError {
  #[error("symbolic link target too long for a memo: {0} bytes")]
  TargetTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoDecodeError {
  #[error("not a hex string")]
  Hex,
  #[error("unsupported memo encoding version {0}")]
  Version(u8),
  #[error("truncated memo")]
  Truncated,
  #[error("memo has {0} trailing bytes")]
  Trailing(usize),
  #[error("symbolic link target is not UTF-8")]
  Utf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSummary {
  pub mode: u32,
  pub size: u64,
  pub mtime_ns: i64,
  pub uid: u32,
  pub gid: u32,
}

impl StatSummary {
  pub fn is_dir(&self) -> bool {
    self.mode & S_IFMT == S_IFDIR
  }

  pub fn is_regular_file(&self) -> bool {
    self.mode & S_IFMT == S_IFREG
  }

  pub fn is_symlink(&self) -> bool {
    self.mode & S_IFMT == S_IFLNK
  }

  fn file_type(&self) -> u32 {
    self.mode & S_IFMT
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemObjectMemo {
  /// `None` if the object did not exist.
  pub stat: Option<StatSummary>,
  pub symlink_target: Option<String>,
}

impl FilesystemObjectMemo {
  pub fn non_existent() -> Self {
    FilesystemObjectMemo::default()
  }

  pub fn exists(&self) -> bool {
    self.stat.is_some()
  }

  pub fn encode(&self) -> Result<Vec<u8>, MemoEncodeError> {
    let mut buf = vec![MEMO_ENCODING_VERSION, 0];
    if let Some(stat) = &self.stat {
      buf[1] |= FLAG_STAT;
      buf.extend_from_slice(&stat.mode.to_le_bytes());
      buf.extend_from_slice(&stat.size.to_le_bytes());
      buf.extend_from_slice(&stat.mtime_ns.to_le_bytes());
      buf.extend_from_slice(&stat.uid.to_le_bytes());
      buf.extend_from_slice(&stat.gid.to_le_bytes());
    }
    if let Some(target) = &self.symlink_target {
      buf[1] |= FLAG_SYMLINK_TARGET;
      let bytes = target.as_bytes();
      buf.extend_from_slice(&length_prefix(bytes.len())?);
      buf.extend_from_slice(bytes);
    }
    Ok(buf)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, MemoDecodeError> {
    let mut r = Reader { bytes, pos: 0 };
    let version = r.u8()?;
    if version != MEMO_ENCODING_VERSION {
      return Err(MemoDecodeError::Version(version));
    }
    let flags = r.u8()?;

    let stat = if flags & FLAG_STAT != 0 {
      Some(StatSummary {
        mode: u32::from_le_bytes(r.array()?),
        size: u64::from_le_bytes(r.array()?),
        mtime_ns: i64::from_le_bytes(r.array()?),
        uid: u32::from_le_bytes(r.array()?),
        gid: u32::from_le_bytes(r.array()?),
      })
    } else {
      None
    };

    let symlink_target = if flags & FLAG_SYMLINK_TARGET != 0 {
      let len = u32::from_le_bytes(r.array()?) as usize;
      let raw = r.take(len)?;
      Some(String::from_utf8(raw.to_vec()).map_err(|_| MemoDecodeError::Utf8)?)
    } else {
      None
    };

    let rest = bytes.len() - r.pos;
    if rest > 0 {
      return Err(MemoDecodeError::Trailing(rest));
    }
    Ok(FilesystemObjectMemo { stat, symlink_target })
  }

  pub fn encode_hex(&self) -> Result<String, MemoEncodeError> {
    self.encode().map(hex::encode)
  }

  pub fn decode_hex(s: &str) -> Result<Self, MemoDecodeError> {
    let bytes = hex::decode(s).map_err(|_| MemoDecodeError::Hex)?;
    Self::decode(&bytes)
  }
}

fn length_prefix(len: usize) -> Result<[u8; 4], MemoEncodeError> {
  u32::try_from(len)
    .map(u32::to_le_bytes)
    .map_err(|_| MemoEncodeError::TargetTooLong(len))
}

struct Reader<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn take(&mut self, n: usize) -> Result<&'a [u8], MemoDecodeError> {
    let end = self.pos.checked_add(n).ok_or(MemoDecodeError::Truncated)?;
    let slice = self.bytes.get(self.pos..end).ok_or(MemoDecodeError::Truncated)?;
    self.pos = end;
    Ok(slice)
  }

  fn u8(&mut self) -> Result<u8, MemoDecodeError> {
    Ok(self.take(1)?[0])
  }

  fn array<const N: usize>(&mut self) -> Result<[u8; N], MemoDecodeError> {
    let mut a = [0u8; N];
    a.copy_from_slice(self.take(N)?);
    Ok(a)
  }
}

/// Reads the memo of the object at `abs_path` without following a final symbolic link.
///
/// A missing object is reported as `io::ErrorKind::NotFound`.
pub fn read_filesystem_object_memo(abs_path: &std::path::Path) -> io::Result<FilesystemObjectMemo> {
  let md = std::fs::symlink_metadata(abs_path)?;
  let stat = stat_summary(&md);
  let symlink_target = if md.file_type().is_symlink() {
    let target = std::fs::read_link(abs_path)?;
    Some(target.to_string_lossy().into_owned())
  } else {
    None
  };
  Ok(FilesystemObjectMemo {
    stat: Some(stat),
    symlink_target,
  })
}

#[cfg(unix)]
fn stat_summary(md: &std::fs::Metadata) -> StatSummary {
  use std::os::unix::fs::MetadataExt;
  StatSummary {
    mode: md.mode(),
    size: md.size(),
    mtime_ns: md.mtime().saturating_mul(1_000_000_000).saturating_add(md.mtime_nsec()),
    uid: md.uid(),
    gid: md.gid(),
  }
}

#[cfg(not(unix))]
fn stat_summary(md: &std::fs::Metadata) -> StatSummary {
  let ft = md.file_type();
  let kind = if ft.is_symlink() {
    S_IFLNK
  } else if ft.is_dir() {
    S_IFDIR
  } else {
    S_IFREG
  };
  let perm = if md.permissions().readonly() { 0o444 } else { 0o666 };
  let mtime_ns = md
    .modified()
    .ok()
    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
    .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
    .unwrap_or_default();
  StatSummary {
    mode: kind | perm,
    size: md.len(),
    mtime_ns,
    uid: 0,
    gid: 0,
  }
}

/// Why a live memo does not match the memo recorded before the last successful redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoChange {
  /// The object was a new dependency, or a redo potentially modified it.
  NotRecorded,
  StateUnknown,
  DidNotExist,
  Existence,
  FileType,
  SymlinkTarget,
  Size,
  Mtime,
  PermissionsOrOwner,
}

impl fmt::Display for MemoChange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      MemoChange::NotRecorded => "was a new dependency or was potentially changed by a redo",
      MemoChange::StateUnknown => "state before last successful redo is unknown",
      MemoChange::DidNotExist => "filesystem object did not exist",
      MemoChange::Existence => "existence has changed",
      MemoChange::FileType => "type of filesystem object has changed",
      MemoChange::SymlinkTarget => "symbolic link target has changed",
      MemoChange::Size => "size has changed",
      MemoChange::Mtime => "mtime has changed",
      MemoChange::PermissionsOrOwner => "permissions or owner have changed",
    };
    f.write_str(s)
  }
}

/// Compares a live memo with the hex-encoded memo recorded by the last successful redo.
///
/// For explicit inputs the live object is known to exist.
pub fn compare_to_recorded(
  memo: &FilesystemObjectMemo,
  recorded: Option<&str>,
  is_explicit: bool,
) -> Option<MemoChange> {
  let Some(recorded) = recorded else {
    return Some(MemoChange::NotRecorded);
  };
  let Ok(last) = FilesystemObjectMemo::decode_hex(recorded) else {
    return Some(MemoChange::StateUnknown);
  };

  let (live, last) = match (&memo.stat, &last.stat) {
    (Some(_), None) if is_explicit => return Some(MemoChange::DidNotExist),
    (None, None) => return None,
    (Some(a), Some(b)) => ((a, &memo.symlink_target), (b, &last.symlink_target)),
    _ => return Some(MemoChange::Existence),
  };

  let ((a, a_target), (b, b_target)) = (live, last);
  if a.file_type() != b.file_type() {
    return Some(MemoChange::FileType);
  }
  if a.is_symlink() && a_target != b_target {
    return Some(MemoChange::SymlinkTarget);
  }
  if a.size != b.size {
    return Some(MemoChange::Size);
  }
  if a.mtime_ns != b.mtime_ns {
    return Some(MemoChange::Mtime);
  }
  if (a.mode, a.uid, a.gid) != (b.mode, b.uid, b.gid) {
    return Some(MemoChange::PermissionsOrOwner);
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn regular(size: u64, mtime_ns: i64) -> FilesystemObjectMemo {
    FilesystemObjectMemo {
      stat: Some(StatSummary {
        mode: S_IFREG | 0o644,
        size,
        mtime_ns,
        uid: 1000,
        gid: 1000,
      }),
      symlink_target: None,
    }
  }

  #[test]
  fn encoding_is_versioned() {
    let m = regular(3, 42);
    let bytes = m.encode().unwrap();
    assert_eq!(bytes[0], MEMO_ENCODING_VERSION);
    assert_eq!(FilesystemObjectMemo::decode(&bytes).unwrap(), m);

    let mut other_version = bytes.clone();
    other_version[0] = 7;
    assert_eq!(
      FilesystemObjectMemo::decode(&other_version),
      Err(MemoDecodeError::Version(7))
    );
  }

  #[test]
  fn length_prefix_does_not_truncate() {
    assert_eq!(length_prefix(5), Ok([5, 0, 0, 0]));
    assert_eq!(length_prefix(u32::MAX as usize), Ok([0xff; 4]));
    #[cfg(target_pointer_width = "64")]
    assert_eq!(
      length_prefix(u32::MAX as usize + 1),
      Err(MemoEncodeError::TargetTooLong(u32::MAX as usize + 1))
    );
  }

  #[test]
  fn truncated_and_trailing_bytes_are_rejected() {
    let bytes = regular(1, 1).encode().unwrap();
    assert_eq!(
      FilesystemObjectMemo::decode(&bytes[..bytes.len() - 1]),
      Err(MemoDecodeError::Truncated)
    );
    let mut longer = bytes.clone();
    longer.push(0);
    assert_eq!(FilesystemObjectMemo::decode(&longer), Err(MemoDecodeError::Trailing(1)));
  }

  #[test]
  fn symlink_target_survives_encoding() {
    let m = FilesystemObjectMemo {
      stat: Some(StatSummary {
        mode: S_IFLNK | 0o777,
        size: 5,
        mtime_ns: 1,
        uid: 0,
        gid: 0,
      }),
      symlink_target: Some("../a".to_string()),
    };
    assert_eq!(FilesystemObjectMemo::decode_hex(&m.encode_hex().unwrap()).unwrap(), m);
  }

  #[test]
  fn compare_reports_first_difference() {
    let recorded = regular(3, 100).encode_hex().unwrap();
    assert_eq!(compare_to_recorded(&regular(3, 100), Some(&recorded), true), None);
    assert_eq!(
      compare_to_recorded(&regular(4, 200), Some(&recorded), true),
      Some(MemoChange::Size)
    );
    assert_eq!(
      compare_to_recorded(&regular(3, 200), Some(&recorded), true),
      Some(MemoChange::Mtime)
    );
    assert_eq!(
      compare_to_recorded(&FilesystemObjectMemo::non_existent(), Some(&recorded), false),
      Some(MemoChange::Existence)
    );
  }

  #[test]
  fn compare_handles_missing_and_corrupt_records() {
    let live = regular(1, 1);
    assert_eq!(compare_to_recorded(&live, None, false), Some(MemoChange::NotRecorded));
    assert_eq!(
      compare_to_recorded(&live, Some("zz-not-hex"), false),
      Some(MemoChange::StateUnknown)
    );
    assert_eq!(
      compare_to_recorded(&live, Some("ff00"), false),
      Some(MemoChange::StateUnknown)
    );
    let absent = FilesystemObjectMemo::non_existent().encode_hex().unwrap();
    assert_eq!(compare_to_recorded(&live, Some(&absent), true), Some(MemoChange::DidNotExist));
    assert_eq!(
      compare_to_recorded(&FilesystemObjectMemo::non_existent(), Some(&absent), false),
      None
    );
  }

  #[test]
  fn read_memo_of_file_and_directory() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("a.txt");
    std::fs::write(&file, b"abc").unwrap();

    let memo = read_filesystem_object_memo(&file).unwrap();
    let stat = memo.stat.unwrap();
    assert!(stat.is_regular_file());
    assert_eq!(stat.size, 3);

    let dir_memo = read_filesystem_object_memo(temp.path()).unwrap();
    assert!(dir_memo.stat.unwrap().is_dir());

    let missing = read_filesystem_object_memo(&temp.path().join("missing")).unwrap_err();
    assert_eq!(missing.kind(), io::ErrorKind::NotFound);
  }

  #[cfg(unix)]
  #[test]
  fn read_memo_of_symlink_does_not_follow() {
    let temp = TempDir::new().unwrap();
    let link = temp.path().join("l");
    std::os::unix::fs::symlink("target", &link).unwrap();
    let memo = read_filesystem_object_memo(&link).unwrap();
    assert!(memo.stat.unwrap().is_symlink());
    assert_eq!(memo.symlink_target.as_deref(), Some("target"));
  }
}
