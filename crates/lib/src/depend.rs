//! Dependency descriptors and validation of concrete dependency values.
//!
//! A [`Dependency`] describes one named role of a tool: whether it is an input, an output or an
//! intermediate, what kind of value it holds, how many elements it accepts, and whether the
//! caller of the tool (explicit) or the redo (non-explicit) supplies the value.
//!
//! Descriptors are created with the constructor functions in [`input`], [`output`] and
//! [`intermediate`] and refined with builder-style modifiers:
//!
//! ```ignore
//! let headers = input::regular_file()
//!   .multiplicity("[:]".parse()?)
//!   .explicit(false);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::error::Error;
use crate::fs::{Path, PathClass};
use crate::mult::Multiplicity;

/// A value that was rejected by a dependency descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValueError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
  Input,
  Intermediate,
  Output,
}

/// A compiled environment variable pattern; matches only complete values.
#[derive(Debug, Clone)]
pub struct EnvVarPattern {
  source: String,
  anchored: Regex,
}

impl EnvVarPattern {
  pub fn new(pattern: &str) -> Result<Self, ValueError> {
    let anchored = Regex::new(&format!("^(?:{pattern})$"))
      .map_err(|e| ValueError(format!("invalid regular expression {pattern:?}: {e}")))?;
    Ok(EnvVarPattern {
      source: pattern.to_string(),
      anchored,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }

  pub fn is_full_match(&self, value: &str) -> bool {
    self.anchored.is_match(value)
  }

  /// Named groups of a complete match, or `None` if `value` does not match.
  pub fn groups(&self, value: &str) -> Option<BTreeMap<String, String>> {
    let caps = self.anchored.captures(value)?;
    let groups = self
      .anchored
      .capture_names()
      .flatten()
      .filter_map(|n| caps.name(n).map(|m| (n.to_string(), m.as_str().to_string())))
      .collect();
    Some(groups)
  }
}

impl PartialEq for EnvVarPattern {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
  }
}

impl Serialize for EnvVarPattern {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.source)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Kind {
  RegularFile { replace_by_same_content: bool },
  NonRegularFile,
  Directory,
  EnvVar {
    name: String,
    pattern: EnvVarPattern,
    example: String,
  },
  Object,
}

impl Kind {
  fn same_variant(&self, other: &Kind) -> bool {
    std::mem::discriminant(self) == std::mem::discriminant(other)
  }

  pub fn is_filesystem_object(&self) -> bool {
    matches!(self, Kind::RegularFile { .. } | Kind::NonRegularFile | Kind::Directory)
  }
}

/// Declaration of one dependency role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dependency {
  role: Role,
  kind: Kind,
  multiplicity: Option<Multiplicity>,
  required: bool,
  explicit: bool,
  unique: bool,
  path_class: PathClass,
}

pub mod input {
  use super::*;

  pub fn regular_file() -> Dependency {
    Dependency::new(
      Role::Input,
      Kind::RegularFile {
        replace_by_same_content: true,
      },
    )
  }

  pub fn non_regular_file() -> Dependency {
    Dependency::new(Role::Input, Kind::NonRegularFile)
  }

  pub fn directory() -> Dependency {
    Dependency::new(Role::Input, Kind::Directory)
  }

  /// An environment variable whose complete value must match `pattern`.
  ///
  /// `example` must match too; it documents the expected form.
  pub fn env_var(name: &str, pattern: &str, example: &str) -> Result<Dependency, Error> {
    if name.is_empty() {
      return Err(Error::Dependency("'name' must not be empty".to_string()));
    }
    let pattern = EnvVarPattern::new(pattern).map_err(|e| Error::Dependency(e.0))?;
    if !pattern.is_full_match(example) {
      return Err(Error::Dependency(format!(
        "'example' is not matched by 'pattern': {example:?}"
      )));
    }
    Ok(Dependency::new(
      Role::Input,
      Kind::EnvVar {
        name: name.to_string(),
        pattern,
        example: example.to_string(),
      },
    ))
  }
}

pub mod output {
  use super::*;

  pub fn regular_file() -> Dependency {
    Dependency::new(
      Role::Output,
      Kind::RegularFile {
        replace_by_same_content: true,
      },
    )
  }

  pub fn non_regular_file() -> Dependency {
    Dependency::new(Role::Output, Kind::NonRegularFile)
  }

  pub fn directory() -> Dependency {
    Dependency::new(Role::Output, Kind::Directory)
  }

  /// An arbitrary value produced by the redo. Always non-explicit.
  pub fn object() -> Dependency {
    Dependency::new(Role::Output, Kind::Object).explicit(false)
  }
}

/// Values and paths a redo works with that are neither tracked inputs nor tracked outputs.
pub mod intermediate {
  use super::*;

  pub fn regular_file() -> Dependency {
    Dependency::new(
      Role::Intermediate,
      Kind::RegularFile {
        replace_by_same_content: true,
      },
    )
  }

  pub fn directory() -> Dependency {
    Dependency::new(Role::Intermediate, Kind::Directory)
  }

  pub fn object() -> Dependency {
    Dependency::new(Role::Intermediate, Kind::Object)
  }
}

impl Dependency {
  fn new(role: Role, kind: Kind) -> Self {
    Dependency {
      role,
      kind,
      multiplicity: None,
      required: true,
      explicit: true,
      unique: true,
      path_class: PathClass::Path,
    }
  }

  pub fn multiplicity(mut self, m: Multiplicity) -> Self {
    self.multiplicity = Some(m);
    self
  }

  pub fn required(mut self, required: bool) -> Self {
    self.required = required;
    self
  }

  pub fn explicit(mut self, explicit: bool) -> Self {
    self.explicit = explicit;
    self
  }

  /// Whether elements of a value with multiplicity must be pairwise different. Default: true.
  pub fn unique(mut self, unique: bool) -> Self {
    self.unique = unique;
    self
  }

  pub fn path_class(mut self, class: PathClass) -> Self {
    self.path_class = class;
    self
  }

  /// For regular file outputs: `false` keeps an existing output whose content equals its
  /// replacement.
  pub fn replace_by_same_content(mut self, replace: bool) -> Self {
    if let Kind::RegularFile {
      replace_by_same_content,
    } = &mut self.kind
    {
      *replace_by_same_content = replace;
    }
    self
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn kind(&self) -> &Kind {
    &self.kind
  }

  pub fn get_multiplicity(&self) -> Option<Multiplicity> {
    self.multiplicity
  }

  pub fn is_required(&self) -> bool {
    self.required
  }

  pub fn is_explicit(&self) -> bool {
    self.explicit
  }

  pub fn get_path_class(&self) -> PathClass {
    self.path_class
  }

  pub fn env_var_name(&self) -> Option<&str> {
    match &self.kind {
      Kind::EnvVar { name, .. } => Some(name),
      _ => None,
    }
  }

  pub fn replaces_by_same_content(&self) -> bool {
    !matches!(
      self.kind,
      Kind::RegularFile {
        replace_by_same_content: false
      }
    )
  }

  /// Rejects combinations no tool may declare.
  pub(crate) fn check_declaration(&self) -> Result<(), ValueError> {
    if matches!(self.kind, Kind::EnvVar { .. }) && self.multiplicity.is_some() {
      return Err(ValueError("environment variable dependency must not have a multiplicity".to_string()));
    }
    if self.role == Role::Output && self.kind == Kind::Object && self.explicit {
      return Err(ValueError("output object dependency must not be explicit".to_string()));
    }
    Ok(())
  }

  /// True if `self` may override `other` in a derived tool.
  pub fn is_no_less_restrictive_than(&self, other: &Dependency) -> bool {
    if self.role != other.role || !self.kind.same_variant(&other.kind) {
      return false;
    }
    if let (Kind::EnvVar { name, pattern, .. }, Kind::EnvVar { name: n, pattern: p, .. }) = (&self.kind, &other.kind)
      && (name != n || pattern != p)
    {
      return false;
    }
    match (self.multiplicity, other.multiplicity) {
      (None, None) => {}
      (Some(a), Some(b)) if a.is_within(&b) => {}
      _ => return false,
    }
    if other.required && !self.required {
      return false;
    }
    if other.unique && !self.unique {
      return false;
    }
    self.explicit == other.explicit && self.path_class.is_subclass_of(other.path_class)
  }

  /// Validates a raw value into its concrete form.
  pub fn validate(&self, raw: Raw) -> Result<Concrete, ValueError> {
    if raw.is_none() {
      if self.required {
        return Err(ValueError("value must not be None for a required dependency".to_string()));
      }
      return Ok(Concrete::Absent);
    }

    let Some(m) = self.multiplicity else {
      return self.validate_single(raw).map(Concrete::One);
    };

    let items = match raw {
      Raw::Seq(items) => items,
      Raw::Object(serde_json::Value::Array(items)) => items.into_iter().map(Raw::Object).collect(),
      _ => {
        return Err(ValueError(
          "since dependency has a multiplicity, value must be a sequence (other than a string)".to_string(),
        ));
      }
    };

    let mut values: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
      let v = self.validate_single(item)?;
      if self.unique && values.contains(&v) {
        return Err(ValueError(format!(
          "sequence must be duplicate-free but contains {v} more than once"
        )));
      }
      values.push(v);
    }

    if !m.contains(values.len()) {
      return Err(ValueError(format!(
        "value has {} members, which is not accepted according to the specified multiplicity {m}",
        values.len()
      )));
    }
    Ok(Concrete::Many(values))
  }

  fn validate_single(&self, raw: Raw) -> Result<Value, ValueError> {
    match &self.kind {
      Kind::RegularFile { .. } | Kind::NonRegularFile | Kind::Directory => {
        let path = match raw {
          Raw::Path(p) => p,
          Raw::Str(s) => Path::new(&s).map_err(|e| ValueError(e.to_string()))?,
          Raw::Object(serde_json::Value::String(s)) => Path::new(&s).map_err(|e| ValueError(e.to_string()))?,
          Raw::None => return Err(ValueError("element must not be None".to_string())),
          other => return Err(ValueError(format!("value must be a path or a string, not {other:?}"))),
        };
        self.path_class.check(&path).map_err(|e| ValueError(e.to_string()))?;
        let wants_dir = self.kind == Kind::Directory;
        if path.is_dir() && !wants_dir {
          return Err(ValueError(format!(
            "directory path not valid for non-directory dependency: {path}"
          )));
        }
        if !path.is_dir() && wants_dir {
          return Err(ValueError(format!(
            "non-directory path not valid for directory dependency: {path}"
          )));
        }
        Ok(Value::Path(path))
      }
      Kind::EnvVar { name, pattern, .. } => {
        let raw_value = match raw {
          Raw::Str(s) => s,
          Raw::Object(serde_json::Value::String(s)) => s,
          other => return Err(ValueError(format!("value must be a string, not {other:?}"))),
        };
        let groups = pattern.groups(&raw_value).ok_or_else(|| {
          ValueError(format!(
            "value {raw_value:?} is not matched by validation pattern {:?}",
            pattern.as_str()
          ))
        })?;
        Ok(Value::EnvVar(EnvVarValue {
          name: name.clone(),
          raw: raw_value,
          groups,
        }))
      }
      Kind::Object => {
        let json = raw.into_json();
        if json.is_null() {
          return Err(ValueError("element must not be None".to_string()));
        }
        Ok(Value::Object(json))
      }
    }
  }
}

impl fmt::Display for Dependency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let role = match self.role {
      Role::Input => "input",
      Role::Intermediate => "intermediate",
      Role::Output => "output",
    };
    let kind = match self.kind {
      Kind::RegularFile { .. } => "RegularFile",
      Kind::NonRegularFile => "NonRegularFile",
      Kind::Directory => "Directory",
      Kind::EnvVar { .. } => "EnvVar",
      Kind::Object => "Object",
    };
    write!(f, "{role}.{kind}")?;
    if let Some(m) = self.multiplicity {
      write!(f, "{m}")?;
    }
    Ok(())
  }
}

/// An unvalidated value as supplied by a caller or a redo.
#[derive(Debug, Clone, PartialEq)]
pub enum Raw {
  None,
  Str(String),
  Path(Path),
  Seq(Vec<Raw>),
  Object(serde_json::Value),
}

impl Raw {
  pub fn is_none(&self) -> bool {
    matches!(self, Raw::None | Raw::Object(serde_json::Value::Null))
  }

  fn into_json(self) -> serde_json::Value {
    match self {
      Raw::None => serde_json::Value::Null,
      Raw::Str(s) => serde_json::Value::String(s),
      Raw::Path(p) => serde_json::Value::String(p.as_string()),
      Raw::Seq(items) => serde_json::Value::Array(items.into_iter().map(Raw::into_json).collect()),
      Raw::Object(v) => v,
    }
  }
}

impl From<&str> for Raw {
  fn from(s: &str) -> Self {
    Raw::Str(s.to_string())
  }
}

impl From<String> for Raw {
  fn from(s: String) -> Self {
    Raw::Str(s)
  }
}

impl From<Path> for Raw {
  fn from(p: Path) -> Self {
    Raw::Path(p)
  }
}

impl From<&Path> for Raw {
  fn from(p: &Path) -> Self {
    Raw::Path(p.clone())
  }
}

impl From<serde_json::Value> for Raw {
  fn from(v: serde_json::Value) -> Self {
    Raw::Object(v)
  }
}

impl<T: Into<Raw>> From<Vec<T>> for Raw {
  fn from(items: Vec<T>) -> Self {
    Raw::Seq(items.into_iter().map(Into::into).collect())
  }
}

impl<T: Into<Raw>> From<Option<T>> for Raw {
  fn from(v: Option<T>) -> Self {
    v.map_or(Raw::None, Into::into)
  }
}

/// Validated value of an environment variable dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVarValue {
  pub name: String,
  pub raw: String,
  pub groups: BTreeMap<String, String>,
}

/// One validated element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
  Path(Path),
  EnvVar(EnvVarValue),
  Object(serde_json::Value),
}

impl Value {
  pub fn as_path(&self) -> Option<&Path> {
    match self {
      Value::Path(p) => Some(p),
      _ => None,
    }
  }

  pub fn as_env_var(&self) -> Option<&EnvVarValue> {
    match self {
      Value::EnvVar(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&serde_json::Value> {
    match self {
      Value::Object(v) => Some(v),
      _ => None,
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Path(p) => write!(f, "{:?}", p.as_string()),
      Value::EnvVar(v) => write!(f, "{:?}", v.raw),
      Value::Object(v) => write!(f, "{v}"),
    }
  }
}

/// A validated dependency value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum Concrete {
  #[default]
  Absent,
  One(Value),
  Many(Vec<Value>),
}

impl Concrete {
  pub fn is_absent(&self) -> bool {
    matches!(self, Concrete::Absent)
  }

  /// All elements; empty if absent.
  pub fn values(&self) -> &[Value] {
    match self {
      Concrete::Absent => &[],
      Concrete::One(v) => std::slice::from_ref(v),
      Concrete::Many(vs) => vs,
    }
  }

  pub fn paths(&self) -> impl Iterator<Item = &Path> {
    self.values().iter().filter_map(Value::as_path)
  }

  /// The single element, if the value is not a sequence.
  pub fn single(&self) -> Option<&Value> {
    match self {
      Concrete::One(v) => Some(v),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn strs(items: &[&str]) -> Raw {
    Raw::from(items.to_vec())
  }

  #[test]
  fn single_path_is_validated() {
    let d = input::regular_file();
    let v = d.validate("src/a.c".into()).unwrap();
    assert_eq!(v.single().and_then(Value::as_path), Some(&Path::new("src/a.c").unwrap()));
  }

  #[test]
  fn directory_shape_must_match() {
    assert!(input::regular_file().validate("src/".into()).is_err());
    assert!(input::directory().validate("src".into()).is_err());
    assert!(input::directory().validate("src/".into()).is_ok());
  }

  #[test]
  fn path_class_is_enforced() {
    let d = input::regular_file().path_class(PathClass::NoSpacePath);
    assert!(d.validate("a b.c".into()).is_err());
  }

  #[test]
  fn none_only_for_non_required() {
    assert!(input::regular_file().validate(Raw::None).is_err());
    assert_eq!(
      input::regular_file().required(false).validate(Raw::None).unwrap(),
      Concrete::Absent
    );
  }

  #[test]
  fn multiplicity_boundaries() {
    let d = input::regular_file().multiplicity("[2:4]".parse().unwrap());
    assert!(d.validate(strs(&[])).is_err());
    assert!(d.validate(strs(&["a"])).is_err());
    assert!(d.validate(strs(&["a", "b"])).is_ok());
    assert!(d.validate(strs(&["a", "b", "c"])).is_ok());
    let err = d.validate(strs(&["a", "b", "c", "d"])).unwrap_err();
    assert!(err.0.contains("[2:4]"), "{err}");

    let one = input::regular_file().multiplicity(Multiplicity::exact(1).unwrap());
    assert!(one.validate(strs(&["a"])).is_ok());
    assert!(one.validate(strs(&["a", "b"])).is_err());
  }

  #[test]
  fn multiplicity_rejects_strings() {
    let d = input::regular_file().multiplicity("[:]".parse().unwrap());
    let err = d.validate("abc".into()).unwrap_err();
    assert!(err.0.contains("must be a sequence"));
  }

  #[test]
  fn duplicates_are_rejected_unless_not_unique() {
    let d = input::regular_file().multiplicity("[:]".parse().unwrap());
    assert!(d.validate(strs(&["a", "b", "a"])).is_err());
    assert!(d.clone().unique(false).validate(strs(&["a", "b", "a"])).is_ok());
  }

  #[test]
  fn env_var_exposes_groups() {
    let d = input::env_var("LANG", "(?P<language>[a-z]{2})_(?P<territory>[A-Z]{2})", "sv_SE").unwrap();
    let v = d.validate("de_CH".into()).unwrap();
    let ev = v.single().and_then(Value::as_env_var).unwrap();
    assert_eq!(ev.groups["language"], "de");
    assert_eq!(ev.groups["territory"], "CH");
    assert!(d.validate("de_CH.UTF-8".into()).is_err());
  }

  #[test]
  fn env_var_example_must_match() {
    assert!(input::env_var("LANG", "[a-z]+", "DE").is_err());
  }

  #[test]
  fn env_var_must_not_have_multiplicity() {
    let d = input::env_var("X", ".*", "").unwrap().multiplicity(Multiplicity::exact(1).unwrap());
    assert!(d.check_declaration().is_err());
  }

  #[test]
  fn output_object_must_not_be_explicit() {
    assert!(output::object().check_declaration().is_ok());
    assert!(output::object().explicit(true).check_declaration().is_err());
  }

  #[test]
  fn object_accepts_json() {
    let d = output::object();
    let v = d.validate(serde_json::json!({"a": 1}).into()).unwrap();
    assert_eq!(v.single().and_then(Value::as_object), Some(&serde_json::json!({"a": 1})));
    assert!(d.validate(serde_json::Value::Null.into()).is_err());
  }

  #[test]
  fn restriction_of_overrides() {
    let base = input::regular_file().multiplicity("[1:5]".parse().unwrap()).required(false);

    let narrower = base.clone().multiplicity("[2:3]".parse().unwrap()).required(true);
    assert!(narrower.is_no_less_restrictive_than(&base));

    let wider = base.clone().multiplicity("[0:]".parse().unwrap());
    assert!(!wider.is_no_less_restrictive_than(&base));

    let other_step = base.clone().multiplicity("[1:5:2]".parse().unwrap());
    assert!(!other_step.is_no_less_restrictive_than(&base));

    let required_base = base.clone().required(true);
    assert!(!base.is_no_less_restrictive_than(&required_base));

    let stricter_class = base.clone().path_class(PathClass::PortablePath);
    assert!(stricter_class.is_no_less_restrictive_than(&base));
    assert!(!base.is_no_less_restrictive_than(&stricter_class));

    assert!(!input::directory().is_no_less_restrictive_than(&input::regular_file()));
    assert!(!output::regular_file().is_no_less_restrictive_than(&input::regular_file()));
    assert!(!base.clone().explicit(false).is_no_less_restrictive_than(&base));
  }

  #[test]
  fn display_names_role_kind_and_multiplicity() {
    let d = input::regular_file().multiplicity("[1:]".parse().unwrap());
    assert_eq!(d.to_string(), "input.RegularFile[1:]");
  }
}
