//! Immutable path values and the path classes that restrict them.
//!
//! A [`Path`] is a list of components plus two flags: absolute or relative, and directory or
//! non-directory. Paths use `/` as separator regardless of the platform; [`Path::native`]
//! converts to a `PathBuf`.
//!
//! A [`PathClass`] is a named set of restrictions. Classes form a fixed hierarchy, and a path
//! belongs to a class if it satisfies the restrictions of the class and all its bases.

use std::fmt;
use std::path::{Component, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
  #[error("invalid path: must not be empty")]
  Empty,

  #[error("invalid path {path:?}: {reason}")]
  Invalid { path: String, reason: String },
}

impl PathError {
  fn invalid(path: &Path, reason: impl Into<String>) -> Self {
    PathError::Invalid {
      path: path.to_string(),
      reason: reason.into(),
    }
  }
}

/// An immutable, case-sensitive path.
///
/// The derived ordering compares the absolute flag, then the components, then the directory flag,
/// so a directory path sorts right after the non-directory path with the same components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Path {
  absolute: bool,
  components: Vec<String>,
  dir: bool,
}

impl Path {
  pub fn new(s: &str) -> Result<Self, PathError> {
    if s.is_empty() {
      return Err(PathError::Empty);
    }
    if s.contains('\0') {
      return Err(PathError::Invalid {
        path: s.to_string(),
        reason: "must not contain NUL".to_string(),
      });
    }

    let absolute = s.starts_with('/');
    let last = s.rsplit('/').next().unwrap_or_default();
    let components: Vec<String> = s
      .split('/')
      .filter(|c| !c.is_empty() && *c != ".")
      .map(str::to_string)
      .collect();
    let dir = s.ends_with('/') || last == "." || last == ".." || components.is_empty();

    Ok(Path {
      absolute,
      components,
      dir,
    })
  }

  /// Path of a directory.
  pub fn dir(s: &str) -> Result<Self, PathError> {
    Ok(Path::new(s)?.with_is_dir(true))
  }

  /// Converts a native path. `is_dir` cannot be derived from a native path and must be given.
  pub fn from_native(p: &std::path::Path, is_dir: bool) -> Result<Self, PathError> {
    let mut absolute = false;
    let mut components = Vec::new();
    for c in p.components() {
      match c {
        Component::Prefix(prefix) => components.push(os_str(prefix.as_os_str(), p)?),
        Component::RootDir => absolute = true,
        Component::CurDir => {}
        Component::ParentDir => components.push("..".to_string()),
        Component::Normal(s) => components.push(os_str(s, p)?),
      }
    }
    let empty_relative = !absolute && components.is_empty();
    let path = Path {
      absolute,
      components,
      dir: is_dir || empty_relative,
    };
    if path.components.iter().any(|c| c.contains('\0') || c.contains('/')) {
      return Err(PathError::invalid(&path, "not representable"));
    }
    Ok(path)
  }

  pub(crate) fn from_components(absolute: bool, components: Vec<String>, dir: bool) -> Self {
    let dir = dir || (!absolute && components.is_empty());
    Path {
      absolute,
      components,
      dir,
    }
  }

  pub fn components(&self) -> &[String] {
    &self.components
  }

  pub fn is_absolute(&self) -> bool {
    self.absolute
  }

  pub fn is_dir(&self) -> bool {
    self.dir
  }

  /// True if no component is `..`.
  pub fn is_normalized(&self) -> bool {
    !self.components.iter().any(|c| c == "..")
  }

  /// Same components with the given directory flag. A path without components stays a directory.
  pub fn with_is_dir(mut self, is_dir: bool) -> Self {
    self.dir = is_dir || self.components.is_empty();
    self
  }

  /// Appends a relative path to a directory path.
  pub fn join(&self, other: &Path) -> Result<Path, PathError> {
    if !self.dir {
      return Err(PathError::invalid(self, "cannot append to a non-directory path"));
    }
    if other.absolute {
      return Err(PathError::invalid(other, "cannot append an absolute path"));
    }
    let mut components = self.components.clone();
    components.extend(other.components.iter().cloned());
    Ok(Path {
      absolute: self.absolute,
      components,
      dir: other.dir,
    })
  }

  /// True if `prefix` is a directory whose components are a prefix of this path's components.
  pub fn is_under(&self, prefix: &Path) -> bool {
    if self == prefix {
      return true;
    }
    prefix.dir
      && self.absolute == prefix.absolute
      && self.components.len() > prefix.components.len()
      && self.components[..prefix.components.len()] == prefix.components[..]
  }

  /// The `/`-separated form; directories end with `/`.
  pub fn as_string(&self) -> String {
    let mut s = String::new();
    if self.absolute {
      s.push('/');
    } else if self.components.is_empty() {
      s.push_str("./");
      return s;
    }
    s.push_str(&self.components.join("/"));
    if self.dir && !self.components.is_empty() {
      s.push('/');
    }
    s
  }

  pub fn native(&self) -> PathBuf {
    let mut p = PathBuf::new();
    if self.absolute {
      p.push(std::path::MAIN_SEPARATOR_STR);
    } else if self.components.is_empty() {
      p.push(".");
    }
    for c in &self.components {
      p.push(c);
    }
    p
  }

  fn string_length(&self) -> usize {
    if !self.absolute && self.components.is_empty() {
      0
    } else {
      self.as_string().chars().count()
    }
  }
}

fn os_str(s: &std::ffi::OsStr, whole: &std::path::Path) -> Result<String, PathError> {
  s.to_str().map(str::to_string).ok_or_else(|| PathError::Invalid {
    path: whole.display().to_string(),
    reason: "not valid UTF-8".to_string(),
  })
}

impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.as_string())
  }
}

impl FromStr for Path {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Path::new(s)
  }
}

impl From<Path> for String {
  fn from(p: Path) -> String {
    p.as_string()
  }
}

impl TryFrom<String> for Path {
  type Error = PathError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    Path::new(&s)
  }
}

/// A named set of restrictions on paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathClass {
  #[default]
  Path,
  RelativePath,
  AbsolutePath,
  NormalizedPath,
  NoSpacePath,
  PosixPath,
  PortablePosixPath,
  WindowsPath,
  PortableWindowsPath,
  PortablePath,
}

const ALL_CLASSES: [PathClass; 10] = [
  PathClass::Path,
  PathClass::RelativePath,
  PathClass::AbsolutePath,
  PathClass::NormalizedPath,
  PathClass::NoSpacePath,
  PathClass::PosixPath,
  PathClass::PortablePosixPath,
  PathClass::WindowsPath,
  PathClass::PortableWindowsPath,
  PathClass::PortablePath,
];

const PORTABLE_POSIX_MAX_COMPONENT_LENGTH: usize = 14;
const PORTABLE_POSIX_MAX_PATH_LENGTH: usize = 255;
const PORTABLE_WINDOWS_MAX_COMPONENT_LENGTH: usize = 255;
const PORTABLE_WINDOWS_MAX_PATH_LENGTH: usize = 259;
const WINDOWS_RESERVED_CHARACTERS: &[char] = &['"', '|', '?', '*', '<', '>', ':', '\\'];

impl PathClass {
  fn bases(self) -> &'static [PathClass] {
    match self {
      PathClass::Path => &[],
      PathClass::RelativePath
      | PathClass::AbsolutePath
      | PathClass::NormalizedPath
      | PathClass::NoSpacePath
      | PathClass::PosixPath
      | PathClass::WindowsPath => &[PathClass::Path],
      PathClass::PortablePosixPath => &[PathClass::PosixPath],
      PathClass::PortableWindowsPath => &[PathClass::WindowsPath],
      PathClass::PortablePath => &[
        PathClass::PortablePosixPath,
        PathClass::PortableWindowsPath,
        PathClass::RelativePath,
      ],
    }
  }

  /// Reflexive and transitive.
  pub fn is_subclass_of(self, other: PathClass) -> bool {
    self == other || self.bases().iter().any(|b| b.is_subclass_of(other))
  }

  /// Checks the restrictions of this class and all its bases.
  pub fn check(self, path: &Path) -> Result<(), PathError> {
    for class in ALL_CLASSES {
      if self.is_subclass_of(class) {
        class.check_own(path)?;
      }
    }
    Ok(())
  }

  fn check_own(self, path: &Path) -> Result<(), PathError> {
    match self {
      PathClass::Path | PathClass::PosixPath | PathClass::PortablePath => Ok(()),
      PathClass::RelativePath if path.absolute => Err(PathError::invalid(path, "must be relative")),
      PathClass::AbsolutePath if !path.absolute => Err(PathError::invalid(path, "must be absolute")),
      PathClass::NormalizedPath if !path.is_normalized() => Err(PathError::invalid(path, "must be normalized")),
      PathClass::NoSpacePath if path.components.iter().any(|c| c.contains(' ')) => {
        Err(PathError::invalid(path, "must not contain space"))
      }
      PathClass::PortablePosixPath => check_portable_posix(path),
      PathClass::WindowsPath => check_windows(path),
      PathClass::PortableWindowsPath => check_portable_windows(path),
      _ => Ok(()),
    }
  }
}

fn check_portable_posix(path: &Path) -> Result<(), PathError> {
  for c in &path.components {
    if c.chars().count() > PORTABLE_POSIX_MAX_COMPONENT_LENGTH {
      return Err(PathError::invalid(
        path,
        format!("component must not contain more than {PORTABLE_POSIX_MAX_COMPONENT_LENGTH} characters"),
      ));
    }
    if c.starts_with('-') {
      return Err(PathError::invalid(path, "component must not start with '-'"));
    }
    let mut invalid: Vec<char> = c
      .chars()
      .filter(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')))
      .collect();
    if !invalid.is_empty() {
      invalid.sort_unstable();
      invalid.dedup();
      let listed: Vec<String> = invalid.iter().map(|ch| format!("{ch:?}")).collect();
      return Err(PathError::invalid(
        path,
        format!("must not contain these characters: {}", listed.join(",")),
      ));
    }
  }
  if path.string_length() > PORTABLE_POSIX_MAX_PATH_LENGTH {
    return Err(PathError::invalid(
      path,
      format!("must not contain more than {PORTABLE_POSIX_MAX_PATH_LENGTH} characters"),
    ));
  }
  Ok(())
}

fn check_windows(path: &Path) -> Result<(), PathError> {
  if let Some(last) = path.components.last() {
    let upper = last.to_uppercase();
    let reserved = matches!(upper.as_str(), "CON" | "PRN" | "AUX" | "NUL")
      || ((upper.starts_with("COM") || upper.starts_with("LPT"))
        && upper.len() == 4
        && matches!(upper.as_bytes()[3], b'1'..=b'9'));
    if reserved {
      return Err(PathError::invalid(path, "path is reserved"));
    }
  }
  for c in &path.components {
    if c.chars().any(|ch| WINDOWS_RESERVED_CHARACTERS.contains(&ch)) {
      return Err(PathError::invalid(path, "must not contain reserved characters"));
    }
    if let Some(ch) = c.chars().find(|ch| (*ch as u32) < 0x20) {
      return Err(PathError::invalid(
        path,
        format!("must not contain characters with codepoint lower than U+0020: U+{:04X}", ch as u32),
      ));
    }
    if let Some(ch) = c.chars().find(|ch| (*ch as u32) > 0xFFFF) {
      return Err(PathError::invalid(
        path,
        format!("must not contain characters with codepoint higher than U+FFFF: U+{:04X}", ch as u32),
      ));
    }
  }
  Ok(())
}

fn check_portable_windows(path: &Path) -> Result<(), PathError> {
  for c in &path.components {
    if c.chars().count() > PORTABLE_WINDOWS_MAX_COMPONENT_LENGTH {
      return Err(PathError::invalid(
        path,
        format!("component must not contain more than {PORTABLE_WINDOWS_MAX_COMPONENT_LENGTH} characters"),
      ));
    }
    if c != ".." && (c.ends_with(' ') || c.ends_with('.')) {
      return Err(PathError::invalid(path, "component must not end with ' ' or '.'"));
    }
  }
  if path.string_length() > PORTABLE_WINDOWS_MAX_PATH_LENGTH {
    return Err(PathError::invalid(
      path,
      format!("must not contain more than {PORTABLE_WINDOWS_MAX_PATH_LENGTH} characters"),
    ));
  }
  Ok(())
}

impl fmt::Display for PathClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{self:?}")
  }
}
