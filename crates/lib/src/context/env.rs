//! Environment variable dictionary of a context.
//!
//! A variable must be declared with `import_from_outer()` in a frame before it can be assigned
//! there or in an inner frame. Each declaration adds a validation pattern; a value must fully
//! match the patterns of all frames that declare the variable.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::context::Context;
use crate::depend::EnvVarPattern;
use crate::error::{Error, Result};

lazy_static! {
  static ref ENV_VAR_NAME: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Declarations and assignments of one context frame.
#[derive(Debug, Default)]
pub(crate) struct EnvFrame {
  declared: BTreeMap<String, EnvVarPattern>,
  /// `None` marks a variable removed in this frame.
  values: BTreeMap<String, Option<String>>,
}

/// Value of `name` as seen from the innermost of `frames`.
pub(crate) fn effective_value(frames: &[&EnvFrame], name: &str) -> Option<String> {
  frames
    .iter()
    .rev()
    .find_map(|f| f.values.get(name))
    .cloned()
    .flatten()
}

/// All declared variables with a value, as seen from the innermost of `frames`.
pub(crate) fn effective_values(frames: &[&EnvFrame]) -> BTreeMap<String, String> {
  frames
    .iter()
    .flat_map(|f| f.declared.keys())
    .filter_map(|name| effective_value(frames, name).map(|v| (name.clone(), v)))
    .collect()
}

fn check_value(frames: &[&EnvFrame], name: &str, value: &str) -> Result<()> {
  for pattern in frames.iter().filter_map(|f| f.declared.get(name)) {
    if !pattern.is_full_match(value) {
      return Err(Error::EnvVar(format!(
        "value for environment variable {name:?} is not matched by validation pattern {:?}: {value:?}",
        pattern.as_str()
      )));
    }
  }
  Ok(())
}

/// Handle to the environment variables of a context; see [`Context::env`].
pub struct EnvDict<'a> {
  ctx: &'a Context,
}

impl<'a> EnvDict<'a> {
  pub(crate) fn new(ctx: &'a Context) -> Self {
    EnvDict { ctx }
  }

  /// Declares `name` in this context, validated by `pattern`.
  ///
  /// The initial value is the one of the enclosing context, or, in a root context, the one of the
  /// outer (process) environment. `example` must be matched by `pattern`.
  pub fn import_from_outer(&self, name: &str, pattern: &str, example: &str) -> Result<()> {
    self.ctx.begin_modification("declare an environment variable")?;
    if !ENV_VAR_NAME.is_match(name) {
      return Err(Error::EnvVar(format!("invalid environment variable name: {name:?}")));
    }
    let pattern = EnvVarPattern::new(pattern).map_err(|e| Error::EnvVar(e.to_string()))?;
    if !pattern.is_full_match(example) {
      return Err(Error::EnvVar(format!(
        "example is not matched by validation pattern {:?}: {example:?}",
        pattern.as_str()
      )));
    }

    let root = &self.ctx.root;
    let mut frames = root.frames.borrow_mut();
    let depth = self.ctx.depth;
    let outer = if depth == 0 {
      root.outer_env.get(name).cloned()
    } else {
      let parents: Vec<&EnvFrame> = frames[..depth].iter().map(|f| &f.env).collect();
      effective_value(&parents, name)
    };

    if let Some(value) = &outer {
      let chain: Vec<&EnvFrame> = frames[..depth].iter().map(|f| &f.env).collect();
      check_value(&chain, name, value)?;
      if !pattern.is_full_match(value) {
        return Err(Error::EnvVar(format!(
          "value of environment variable {name:?} in the outer context is not matched by validation pattern {:?}: {value:?}",
          pattern.as_str()
        )));
      }
    }

    let frame = &mut frames[depth].env;
    frame.declared.insert(name.to_string(), pattern);
    if let Some(value) = outer {
      frame.values.insert(name.to_string(), Some(value));
    }
    debug!(name, depth, "imported environment variable");
    Ok(())
  }

  /// Assigns `value` to the declared variable `name` in this context only.
  pub fn set(&self, name: &str, value: &str) -> Result<()> {
    self.ctx.begin_modification("assign an environment variable")?;
    let mut frames = self.ctx.root.frames.borrow_mut();
    let depth = self.ctx.depth;
    {
      let chain: Vec<&EnvFrame> = frames[..=depth].iter().map(|f| &f.env).collect();
      check_declared(&chain, name)?;
      check_value(&chain, name, value)?;
    }
    frames[depth].env.values.insert(name.to_string(), Some(value.to_string()));
    Ok(())
  }

  /// Removes the value of the declared variable `name` in this context only.
  pub fn remove(&self, name: &str) -> Result<()> {
    self.ctx.begin_modification("remove an environment variable")?;
    let mut frames = self.ctx.root.frames.borrow_mut();
    let depth = self.ctx.depth;
    {
      let chain: Vec<&EnvFrame> = frames[..=depth].iter().map(|f| &f.env).collect();
      check_declared(&chain, name)?;
    }
    frames[depth].env.values.insert(name.to_string(), None);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<String> {
    let frames = self.ctx.root.frames.borrow();
    let chain: Vec<&EnvFrame> = frames[..=self.ctx.depth].iter().map(|f| &f.env).collect();
    effective_value(&chain, name)
  }

  pub fn is_declared(&self, name: &str) -> bool {
    let frames = self.ctx.root.frames.borrow();
    frames[..=self.ctx.depth].iter().any(|f| f.env.declared.contains_key(name))
  }

  /// All declared variables that have a value.
  pub fn to_map(&self) -> BTreeMap<String, String> {
    let frames = self.ctx.root.frames.borrow();
    let chain: Vec<&EnvFrame> = frames[..=self.ctx.depth].iter().map(|f| &f.env).collect();
    effective_values(&chain)
  }
}

fn check_declared(chain: &[&EnvFrame], name: &str) -> Result<()> {
  if chain.iter().any(|f| f.declared.contains_key(name)) {
    return Ok(());
  }
  Err(Error::EnvVar(format!(
    "environment variable not declared in this or an outer context: {name:?}\n  | use 'import_from_outer()' first"
  )))
}
