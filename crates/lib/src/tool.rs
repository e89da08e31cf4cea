//! Tool definitions, tool instances and running them in a context.
//!
//! A [`Tool`] is an immutable, shareable definition: an ordered list of named dependency roles,
//! named execution parameters with defaults, and a redo function. Tools are identified by the
//! source location of their definition:
//!
//! ```ignore
//! let compile = Tool::builder("Compile", dlb::location!())
//!   .dependency("source_file", input::regular_file())
//!   .dependency("object_file", output::regular_file())
//!   .parameter("OPTIMIZE", json!(false))
//!   .redo(|ctx, result| async move { ... Ok(false) })
//!   .build()?;
//!
//! let object = compile.instance().arg("source_file", "a.cpp").arg("object_file", "a.o").build()?;
//! object.run(&ctx, false)?;
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::context::{Context, RunStats};
use crate::depend::{Concrete, Dependency, Kind, Raw, Role, Value};
use crate::error::{Error, Result, first_line};
use crate::fs::Path;
use crate::memo::{FilesystemObjectMemo, read_filesystem_object_memo};
use crate::redo::{LiveMemo, OutputState, RedoCheck, decide};
use crate::rundb::{InputRecord, RunDatabase, RunRecord, unix_now};
use crate::toolrun::{RedoContext, RedoContextInner, RedoResult, ResultProxy, RunResult};
use crate::worktree::{WorkingTree, remove_filesystem_object};

lazy_static! {
  static ref DEPENDENCY_NAME: Regex = Regex::new("^[a-z][a-z0-9]*(_[a-z][a-z0-9]*)+$").unwrap();
  static ref PARAMETER_NAME: Regex = Regex::new("^[A-Z][A-Z0-9]*(_[A-Z][A-Z0-9]*)*$").unwrap();
  /// Signature of every tool built so far, by definition location.
  static ref REGISTRY: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

/// Where a tool is defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DefinitionLocation {
  pub source_path: PathBuf,
  /// Member path if `source_path` is an archive.
  pub in_archive_path: Option<String>,
  pub line: u32,
}

impl DefinitionLocation {
  pub fn new(source_path: impl Into<PathBuf>, line: u32) -> Self {
    DefinitionLocation {
      source_path: source_path.into(),
      in_archive_path: None,
      line,
    }
  }

  pub fn in_archive(archive_path: impl Into<PathBuf>, member: impl Into<String>, line: u32) -> Self {
    DefinitionLocation {
      source_path: archive_path.into(),
      in_archive_path: Some(member.into()),
      line,
    }
  }

  /// Location of `file` as reported by `file!()` in a crate with manifest directory
  /// `manifest_dir`. Relative paths are resolved against the manifest directory or one of its
  /// ancestors (the workspace root).
  #[doc(hidden)]
  pub fn from_source(file: &str, line: u32, manifest_dir: Option<&str>) -> Self {
    let file = std::path::Path::new(file);
    let resolved = match manifest_dir {
      Some(dir) if file.is_relative() => std::path::Path::new(dir)
        .ancestors()
        .map(|d| d.join(file))
        .find(|p| p.is_file()),
      _ => None,
    };
    DefinitionLocation::new(resolved.unwrap_or_else(|| file.to_path_buf()), line)
  }

  fn identity(&self) -> String {
    match &self.in_archive_path {
      Some(member) => format!("{}/{member}:{}", self.source_path.display(), self.line),
      None => format!("{}:{}", self.source_path.display(), self.line),
    }
  }
}

impl fmt::Display for DefinitionLocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.identity())
  }
}

/// The [`DefinitionLocation`] of the macro invocation.
#[macro_export]
macro_rules! location {
  () => {
    $crate::tool::DefinitionLocation::from_source(file!(), line!(), option_env!("CARGO_MANIFEST_DIR"))
  };
}

/// Fingerprint of a tool instance: 20 bytes, shown as hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
  pub fn from_bytes(bytes: [u8; 20]) -> Self {
    Fingerprint(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 20] {
    &self.0
  }

  fn of<T: Serialize>(value: &T) -> Result<Self> {
    let digest = Sha256::digest(canonical_json(value)?.as_bytes());
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[..20]);
    Ok(Fingerprint(bytes))
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&hex::encode(self.0))
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint({self})")
  }
}

fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
  // maps are BTreeMaps, so keys are sorted
  serde_json::to_string(value)
    .map_err(|e| Error::ExecutionParameter(format!("value cannot be serialized\n  | reason: {e}")))
}

pub type RedoFuture = Pin<Box<dyn Future<Output = Result<bool>> + Send>>;

/// Body of a redo. Returns `true` to request a redo at the next run.
pub type RedoFn = Arc<dyn Fn(RedoContext, RedoResult) -> RedoFuture + Send + Sync>;

struct ToolDefinition {
  name: String,
  location: DefinitionLocation,
  /// Own location first, then the ones of the base tools.
  lineage: Vec<DefinitionLocation>,
  dependencies: Arc<Vec<(String, Dependency)>>,
  parameters: Vec<(String, serde_json::Value)>,
  redo: Option<RedoFn>,
  definition_hashes: OnceLock<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct Signature<'a> {
  name: &'a str,
  dependencies: &'a [(String, Dependency)],
  parameters: &'a [(String, serde_json::Value)],
  has_redo: bool,
}

/// An immutable tool definition.
#[derive(Clone)]
pub struct Tool(Arc<ToolDefinition>);

impl Tool {
  pub fn builder(name: impl Into<String>, location: DefinitionLocation) -> ToolBuilder {
    ToolBuilder {
      name: name.into(),
      location,
      base: None,
      dependencies: Vec::new(),
      parameters: Vec::new(),
      redo: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.0.name
  }

  pub fn location(&self) -> &DefinitionLocation {
    &self.0.location
  }

  pub fn identity(&self) -> String {
    format!("{} at {}", self.0.name, self.0.location)
  }

  pub fn dependencies(&self) -> &[(String, Dependency)] {
    &self.0.dependencies
  }

  pub fn dependency(&self, name: &str) -> Option<&Dependency> {
    self.0.dependencies.iter().find(|(n, _)| n == name).map(|(_, d)| d)
  }

  /// Default value of the execution parameter `name`.
  pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
    self.0.parameters.iter().find(|(n, _)| n == name).map(|(_, v)| v)
  }

  pub fn instance(&self) -> InstanceBuilder {
    InstanceBuilder {
      tool: self.clone(),
      args: Vec::new(),
      params: Vec::new(),
    }
  }

  /// Hash of each defining source file (of this tool and its bases), by location.
  ///
  /// A file that cannot be read is represented by the hash of the tool's signature.
  pub fn definition_hashes(&self) -> &BTreeMap<String, String> {
    self.0.definition_hashes.get_or_init(|| {
      let signature = canonical_json(&self.signature()).unwrap_or_default();
      self
        .0
        .lineage
        .iter()
        .map(|loc| {
          let content = fs::read(&loc.source_path).unwrap_or_else(|e| {
            debug!(location = %loc, error = %e, "definition file not readable");
            signature.as_bytes().to_vec()
          });
          (loc.identity(), hex::encode(Sha256::digest(&content)))
        })
        .collect()
    })
  }

  fn signature(&self) -> Signature<'_> {
    Signature {
      name: &self.0.name,
      dependencies: &self.0.dependencies,
      parameters: &self.0.parameters,
      has_redo: self.0.redo.is_some(),
    }
  }
}

impl fmt::Debug for Tool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Tool")
      .field("name", &self.0.name)
      .field("location", &self.0.location.identity())
      .finish_non_exhaustive()
  }
}

pub struct ToolBuilder {
  name: String,
  location: DefinitionLocation,
  base: Option<Tool>,
  dependencies: Vec<(String, Dependency)>,
  parameters: Vec<(String, serde_json::Value)>,
  redo: Option<RedoFn>,
}

impl ToolBuilder {
  /// Inherits the dependency roles, execution parameters and redo of `base`.
  pub fn extends(mut self, base: &Tool) -> Self {
    self.base = Some(base.clone());
    self
  }

  pub fn dependency(mut self, name: impl Into<String>, dependency: Dependency) -> Self {
    self.dependencies.push((name.into(), dependency));
    self
  }

  pub fn parameter(mut self, name: impl Into<String>, default: serde_json::Value) -> Self {
    self.parameters.push((name.into(), default));
    self
  }

  pub fn redo<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(RedoContext, RedoResult) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
  {
    self.redo = Some(Arc::new(move |ctx, result| -> RedoFuture { Box::pin(f(ctx, result)) }));
    self
  }

  /// Checks the declarations and registers the tool at its location.
  pub fn build(self) -> Result<Tool> {
    let (mut dependencies, mut parameters, mut lineage, base_redo) = match &self.base {
      Some(base) => (
        base.0.dependencies.as_ref().clone(),
        base.0.parameters.clone(),
        base.0.lineage.clone(),
        base.0.redo.clone(),
      ),
      None => (Vec::new(), Vec::new(), Vec::new(), None),
    };
    lineage.insert(0, self.location.clone());

    let mut seen = BTreeSet::new();
    for (name, dep) in self.dependencies {
      if !DEPENDENCY_NAME.is_match(&name) {
        return Err(Error::Dependency(format!(
          "invalid dependency role name: {name:?}\n  | must be lower_snake_case with at least two words"
        )));
      }
      if !seen.insert(name.clone()) {
        return Err(Error::Dependency(format!("dependency role declared more than once: {name:?}")));
      }
      dep
        .check_declaration()
        .map_err(|e| Error::Dependency(format!("invalid declaration of dependency role {name:?}: {e}")))?;
      match dependencies.iter_mut().find(|(n, _)| *n == name) {
        Some((_, inherited)) => {
          if !dep.is_no_less_restrictive_than(inherited) {
            return Err(Error::Dependency(format!(
              "attribute {name:?} of base tool may only be overridden by a dependency role that is no less restrictive\n  | inherited: {inherited}, new: {dep}"
            )));
          }
          *inherited = dep;
        }
        None => dependencies.push((name, dep)),
      }
    }

    let mut seen = BTreeSet::new();
    for (name, default) in self.parameters {
      if !PARAMETER_NAME.is_match(&name) {
        return Err(Error::ExecutionParameter(format!(
          "invalid execution parameter name: {name:?}\n  | must be UPPER_SNAKE_CASE"
        )));
      }
      if !seen.insert(name.clone()) {
        return Err(Error::ExecutionParameter(format!(
          "execution parameter declared more than once: {name:?}"
        )));
      }
      match parameters.iter_mut().find(|(n, _)| *n == name) {
        Some((_, inherited)) => *inherited = default,
        None => parameters.push((name, default)),
      }
    }

    let tool = Tool(Arc::new(ToolDefinition {
      name: self.name,
      location: self.location,
      lineage,
      dependencies: Arc::new(dependencies),
      parameters,
      redo: self.redo.or(base_redo),
      definition_hashes: OnceLock::new(),
    }));
    register(&tool)?;
    Ok(tool)
  }
}

fn register(tool: &Tool) -> Result<()> {
  let identity = tool.location().identity();
  let signature = canonical_json(&tool.signature())?;
  let mut registry = REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  match registry.get(&identity) {
    Some(existing) if *existing != signature => Err(Error::DefinitionAmbiguity(format!(
      "invalid tool definition: another tool with a different definition is already defined at {identity}\n  | define each tool at its own location"
    ))),
    Some(_) => Ok(()),
    None => {
      debug!(tool = %tool.name(), location = %identity, "registered tool");
      registry.insert(identity, signature);
      Ok(())
    }
  }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
  tool: String,
  dependencies: BTreeMap<&'a String, &'a Concrete>,
  /// Only the ones that differ from their default.
  parameters: &'a BTreeMap<String, serde_json::Value>,
}

pub struct InstanceBuilder {
  tool: Tool,
  args: Vec<(String, Raw)>,
  params: Vec<(String, serde_json::Value)>,
}

impl InstanceBuilder {
  /// Value of the explicit dependency `name`.
  pub fn arg(mut self, name: impl Into<String>, value: impl Into<Raw>) -> Self {
    self.args.push((name.into(), value.into()));
    self
  }

  /// Overrides the execution parameter `name`.
  pub fn param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.params.push((name.into(), value));
    self
  }

  pub fn build(self) -> Result<ToolInstance> {
    let tool = self.tool;
    let mut values = BTreeMap::new();
    for (name, raw) in self.args {
      let Some(dep) = tool.dependency(&name) else {
        let roles: Vec<&str> = tool.dependencies().iter().map(|(n, _)| n.as_str()).collect();
        return Err(Error::Dependency(format!(
          "keyword argument does not name a dependency role of {}: {name:?}\n  | dependency roles: {}",
          tool.name(),
          roles.join(", ")
        )));
      };
      if !dep.is_explicit() {
        return Err(Error::Dependency(format!(
          "keyword argument does name a non-explicit dependency role: {name:?}\n  | non-explicit dependencies must not be assigned at construction"
        )));
      }
      if values.contains_key(&name) {
        return Err(Error::Dependency(format!("keyword argument given more than once: {name:?}")));
      }
      let concrete = dep
        .validate(raw)
        .map_err(|e| Error::Dependency(format!("keyword argument for dependency role {name:?} is invalid: {dep}\n  | reason: {e}")))?;
      values.insert(name, concrete);
    }
    for (name, dep) in tool.dependencies() {
      if !dep.is_explicit() || values.contains_key(name) {
        continue;
      }
      if dep.is_required() {
        return Err(Error::Dependency(format!(
          "missing keyword argument for required and explicit dependency role: {name:?}"
        )));
      }
      values.insert(name.clone(), Concrete::Absent);
    }

    let mut overrides = BTreeMap::new();
    for (name, value) in self.params {
      let Some(default) = tool.parameter(&name) else {
        return Err(Error::ExecutionParameter(format!(
          "not an execution parameter of {}: {name:?}",
          tool.name()
        )));
      };
      if overrides.contains_key(&name) {
        return Err(Error::ExecutionParameter(format!("execution parameter given more than once: {name:?}")));
      }
      if value != *default {
        overrides.insert(name, value);
      }
    }
    let parameters: BTreeMap<String, serde_json::Value> = tool
      .0
      .parameters
      .iter()
      .map(|(n, d)| (n.clone(), overrides.get(n).unwrap_or(d).clone()))
      .collect();

    let fingerprint = Fingerprint::of(&FingerprintInput {
      tool: tool.location().identity(),
      dependencies: values.iter().filter(|(_, v)| !v.is_absent()).collect(),
      parameters: &overrides,
    })?;
    let parameters_digest = hex::encode(Sha256::digest(canonical_json(&parameters)?.as_bytes()));

    Ok(ToolInstance {
      tool,
      values,
      parameters,
      fingerprint,
      parameters_digest,
    })
  }
}

/// A tool with concrete values for its explicit dependencies and execution parameters.
#[derive(Clone)]
pub struct ToolInstance {
  tool: Tool,
  values: BTreeMap<String, Concrete>,
  parameters: BTreeMap<String, serde_json::Value>,
  fingerprint: Fingerprint,
  parameters_digest: String,
}

impl fmt::Debug for ToolInstance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ToolInstance")
      .field("tool", &self.tool.name())
      .field("fingerprint", &self.fingerprint)
      .field("values", &self.values)
      .finish_non_exhaustive()
  }
}

impl ToolInstance {
  pub fn tool(&self) -> &Tool {
    &self.tool
  }

  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }

  /// Value of the explicit dependency `name`.
  pub fn get(&self, name: &str) -> Option<&Concrete> {
    self.values.get(name)
  }

  pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
    self.parameters.get(name)
  }

  /// Runs the instance and waits for its redo, if one is necessary.
  pub fn run(&self, ctx: &Context, force_redo: bool) -> Result<Arc<RunResult>> {
    self.start(ctx, force_redo)?.complete()
  }

  /// Decides whether a redo is necessary and, if so, submits it.
  ///
  /// Blocks only while the maximum number of redos is running. The redo makes progress the next
  /// time the context waits for pending redos.
  pub fn start(&self, ctx: &Context, force_redo: bool) -> Result<ResultProxy> {
    let root = ctx.active_root("start a tool instance")?;
    let frame = ctx.snapshot();
    let tool_name = self.tool.name();

    // a redo of the same instance may still be running
    root.wait_for_fingerprint(&self.fingerprint)?;

    let tree = root.tree.clone();
    let explicit_inputs = self.explicit_input_memos(&tree)?;
    let (explicit_outputs, replace_by_same_content) = self.explicit_output_states(&tree, &explicit_inputs)?;

    let mut env = BTreeMap::new();
    let mut env_values = BTreeMap::new();
    for (name, dep) in self.tool.dependencies() {
      let Kind::EnvVar { name: var, .. } = dep.kind() else {
        continue;
      };
      let value = if dep.is_explicit() {
        self.values.get(name).cloned().unwrap_or_default()
      } else {
        match frame.env.get(var) {
          Some(raw) => dep.validate(Raw::Str(raw.clone())).map_err(|e| {
            Error::EnvVar(format!(
              "value of environment variable {var:?} in the context is not valid for {name:?}\n  | reason: {e}"
            ))
          })?,
          None if dep.is_required() => {
            return Err(Error::EnvVar(format!(
              "not a defined environment variable in the context: {var:?}\n  | use 'context.env().import_from_outer()' or 'context.env().set()'"
            )));
          }
          None => Concrete::Absent,
        }
      };
      if let Some(v) = value.single().and_then(Value::as_env_var) {
        env.insert(var.clone(), v.raw.clone());
      }
      if !dep.is_explicit() {
        env_values.insert(name.clone(), value);
      }
    }

    let definitions = self.tool.definition_hashes().clone();
    let (record, recorded_non_explicit) = {
      let db = lock_db(&root.rundb);
      let record = db.get(&self.fingerprint).cloned();
      let live = record
        .as_ref()
        .map(|r| live_non_explicit_memos(&tree, r, &explicit_inputs))
        .unwrap_or_default();
      (record, live)
    };

    let reason = decide(&RedoCheck {
      force: force_redo,
      record: record.as_ref(),
      explicit_outputs: &explicit_outputs,
      explicit_inputs: &explicit_inputs,
      recorded_non_explicit_inputs: &recorded_non_explicit,
      definitions: &definitions,
      parameters_digest: &self.parameters_digest,
      env: &env,
    });

    let Some(reason) = reason else {
      debug!(tool = %tool_name, fingerprint = %self.fingerprint, "no redo necessary");
      root.stats.runs_without_redo.fetch_add(1, Ordering::Relaxed);
      return Ok(ResultProxy::ready(Arc::new(RunResult::new(
        tool_name.to_string(),
        self.fingerprint,
        false,
        self.values.clone(),
      ))));
    };
    info!(tool = %tool_name, fingerprint = %self.fingerprint, reason = %reason, "redo necessary");

    let Some(redo) = self.tool.0.redo.clone() else {
      return Err(Error::Redo(format!(
        "redo necessary, but {} has no redo\n  | define one with 'ToolBuilder::redo()'",
        self.tool.identity()
      )));
    };

    let obstructed: Vec<&Path> = explicit_outputs
      .iter()
      .filter(|(_, s)| **s == OutputState::Obstructed)
      .map(|(p, _)| p)
      .collect();
    for path in obstructed {
      warn!(path = %path, "removing obstructive filesystem object of explicit output");
      remove_filesystem_object(&tree.native_of(path), Some(root.temp.as_ref()), true).map_err(|e| {
        Error::WorkingTreePath {
          message: format!("failed to remove obstructive output {}\n  | reason: {}", path.as_string(), first_line(&e)),
          source: Some(Arc::new(e)),
        }
      })?;
    }

    let result = RedoResult::new(self.tool.0.dependencies.clone(), self.values.clone());
    for (name, value) in env_values {
      result.set(&name, value_to_raw(value))?;
    }

    let context = RedoContext::new(RedoContextInner {
      tree: tree.clone(),
      temp: root.temp.clone(),
      env: frame.env.clone(),
      helpers: frame.helpers.clone(),
      find_helpers: frame.find_helpers,
      resolver: root.resolver.clone(),
      path_class: frame.path_class,
      inherits_files: root.config.execute_helper_inherits_files_by_default,
      explicit_outputs: replace_by_same_content,
      modified_outputs: Mutex::new(BTreeSet::new()),
    });

    let aftermath = Aftermath {
      tool_name: tool_name.to_string(),
      fingerprint: self.fingerprint,
      dependencies: self.tool.0.dependencies.clone(),
      tree,
      rundb: root.rundb.clone(),
      stats: root.stats.clone(),
      explicit_inputs,
      explicit_outputs: explicit_outputs.into_keys().collect(),
      env,
      definitions,
      parameters_digest: self.parameters_digest.clone(),
    };
    root.submit(self.fingerprint, frame.max_parallel_redo_count, async move {
      aftermath.run(redo, context, result).await
    })
  }

  /// Managed paths and memos of the explicit input dependencies in the working tree.
  fn explicit_input_memos(&self, tree: &WorkingTree) -> Result<BTreeMap<Path, FilesystemObjectMemo>> {
    let mut memos = BTreeMap::new();
    for (name, dep) in self.tool.dependencies() {
      if dep.role() != Role::Input || !dep.is_explicit() || !dep.kind().is_filesystem_object() {
        continue;
      }
      for path in self.values.get(name).map(Concrete::paths).into_iter().flatten() {
        let managed = match tree.working_tree_path_of(path, true, false) {
          Ok(p) => p,
          Err(e) if path.is_absolute() => {
            debug!(path = %path, reason = %first_line(&e), "input outside of managed tree");
            continue;
          }
          Err(e) => return Err(e),
        };
        let memo = read_filesystem_object_memo(&tree.native_of(&managed)).map_err(|e| {
          if e.kind() == io::ErrorKind::NotFound {
            Error::Dependency(format!(
              "input dependency {name:?} contains a path of a non-existent filesystem object: {}",
              path.as_string()
            ))
          } else {
            Error::WorkingTreePath {
              message: format!("input dependency {name:?} is inaccessible: {}\n  | reason: {}", path.as_string(), first_line(&e)),
              source: Some(Arc::new(e)),
            }
          }
        })?;
        if !memo_matches_kind(&memo, dep.kind()) {
          return Err(Error::Dependency(format!(
            "input dependency {name:?} contains a path of an existing filesystem object of wrong type: {}\n  | expected: {dep}",
            path.as_string()
          )));
        }
        memos.insert(managed, memo);
      }
    }
    Ok(memos)
  }

  /// Live state of each explicit output, and its `replace_by_same_content`.
  fn explicit_output_states(
    &self,
    tree: &WorkingTree,
    explicit_inputs: &BTreeMap<Path, FilesystemObjectMemo>,
  ) -> Result<(BTreeMap<Path, OutputState>, BTreeMap<Path, bool>)> {
    let mut states = BTreeMap::new();
    let mut replace = BTreeMap::new();
    for (name, dep) in self.tool.dependencies() {
      if dep.role() != Role::Output || !dep.is_explicit() || !dep.kind().is_filesystem_object() {
        continue;
      }
      for path in self.values.get(name).map(Concrete::paths).into_iter().flatten() {
        let managed = tree.working_tree_path_of(path, true, false)?;
        if explicit_inputs.contains_key(&managed) {
          return Err(Error::Dependency(format!(
            "output dependency {name:?} contains a path that is also an explicit input dependency: {}",
            path.as_string()
          )));
        }
        if states.contains_key(&managed) {
          return Err(Error::Dependency(format!(
            "output dependency {name:?} contains a path that is already an output dependency: {}",
            path.as_string()
          )));
        }
        let state = match read_filesystem_object_memo(&tree.native_of(&managed)) {
          Ok(memo) if memo_matches_kind(&memo, dep.kind()) => OutputState::Present,
          Ok(_) => OutputState::Obstructed,
          Err(e) if e.kind() == io::ErrorKind::NotFound => OutputState::Missing,
          Err(e) => {
            return Err(Error::WorkingTreePath {
              message: format!("output dependency {name:?} is inaccessible: {}\n  | reason: {}", path.as_string(), first_line(&e)),
              source: Some(Arc::new(e)),
            });
          }
        };
        debug!(path = %managed, state = ?state, "checked explicit output");
        replace.insert(managed.clone(), dep.replaces_by_same_content());
        states.insert(managed, state);
      }
    }
    Ok((states, replace))
  }
}

/// Hex-encoded memo; `None` (state unknown) if it cannot be encoded.
fn encoded_memo(path: &Path, memo: &FilesystemObjectMemo) -> Option<String> {
  memo
    .encode_hex()
    .inspect_err(|e| warn!(path = %path, error = %e, "cannot record state of input"))
    .ok()
}

fn memo_matches_kind(memo: &FilesystemObjectMemo, kind: &Kind) -> bool {
  let Some(stat) = &memo.stat else {
    return false;
  };
  match kind {
    Kind::RegularFile { .. } => stat.is_regular_file(),
    Kind::Directory => stat.is_dir(),
    Kind::NonRegularFile => !stat.is_regular_file() && !stat.is_dir(),
    _ => false,
  }
}

fn live_non_explicit_memos(
  tree: &WorkingTree,
  record: &RunRecord,
  explicit_inputs: &BTreeMap<Path, FilesystemObjectMemo>,
) -> BTreeMap<Path, LiveMemo> {
  record
    .inputs
    .iter()
    .filter(|(path, input)| !input.explicit && !explicit_inputs.contains_key(*path))
    .map(|(path, _)| {
      let live = match read_filesystem_object_memo(&tree.native_of(path)) {
        Ok(memo) => Ok(memo),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FilesystemObjectMemo::non_existent()),
        Err(e) => Err(first_line(&e)),
      };
      (path.clone(), live)
    })
    .collect()
}

fn value_to_raw(value: Concrete) -> Raw {
  let element = |v: Value| match v {
    Value::Path(p) => Raw::Path(p),
    Value::EnvVar(e) => Raw::Str(e.raw),
    Value::Object(o) => Raw::Object(o),
  };
  match value {
    Concrete::Absent => Raw::None,
    Concrete::One(v) => element(v),
    Concrete::Many(vs) => Raw::Seq(vs.into_iter().map(element).collect()),
  }
}

pub(crate) fn lock_db(db: &Mutex<RunDatabase>) -> std::sync::MutexGuard<'_, RunDatabase> {
  db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a submitted redo needs to record its run once the body has returned.
struct Aftermath {
  tool_name: String,
  fingerprint: Fingerprint,
  dependencies: Arc<Vec<(String, Dependency)>>,
  tree: Arc<WorkingTree>,
  rundb: Arc<Mutex<RunDatabase>>,
  stats: Arc<RunStats>,
  explicit_inputs: BTreeMap<Path, FilesystemObjectMemo>,
  explicit_outputs: BTreeSet<Path>,
  env: BTreeMap<String, String>,
  definitions: BTreeMap<String, String>,
  parameters_digest: String,
}

impl Aftermath {
  async fn run(self, redo: RedoFn, context: RedoContext, result: RedoResult) -> Result<Arc<RunResult>> {
    let redo_start_ns = self.tree.working_tree_time_ns()?;
    info!(tool = %self.tool_name, fingerprint = %self.fingerprint, "start redo");

    match redo(context.clone(), result.clone()).await {
      Ok(redo_requested) => {
        let run = self.record(&context, &result, redo_start_ns, redo_requested)?;
        info!(tool = %self.tool_name, fingerprint = %self.fingerprint, "redo finished");
        Ok(run)
      }
      Err(e) => {
        error!(tool = %self.tool_name, fingerprint = %self.fingerprint, error = %first_line(&e), "redo failed");
        // the state the last successful redo saw is gone
        if let Err(db_err) = lock_db(&self.rundb).remove(&self.fingerprint) {
          warn!(error = %db_err, "failed to forget run of failed redo");
        }
        Err(e)
      }
    }
  }

  fn record(
    &self,
    context: &RedoContext,
    result: &RedoResult,
    redo_start_ns: i64,
    redo_requested: bool,
  ) -> Result<Arc<RunResult>> {
    for (name, dep) in self.dependencies.iter() {
      if dep.is_explicit() || result.is_assigned(name) {
        continue;
      }
      if dep.is_required() {
        return Err(Error::Redo(format!(
          "non-explicit dependency not assigned during redo: {name:?}\n  | use 'result.set({name:?}, ...)' in the redo"
        )));
      }
      result.assign_absent(name);
    }
    let values = result.seal();

    let mut inputs: BTreeMap<Path, InputRecord> = BTreeMap::new();
    let mut modified = self.explicit_outputs.clone();
    modified.extend(context.modified_outputs());

    for (name, dep) in self.dependencies.iter() {
      if dep.is_explicit() || !dep.kind().is_filesystem_object() {
        continue;
      }
      for path in values.get(name).map(Concrete::paths).into_iter().flatten() {
        let managed = match self.tree.working_tree_path_of(path, true, false) {
          Ok(p) => p,
          Err(e) if dep.role() == Role::Input && path.is_absolute() => {
            debug!(path = %path, reason = %first_line(&e), "ignored non-explicit input outside of managed tree");
            continue;
          }
          Err(e) => {
            return Err(Error::Redo(format!(
              "non-explicit dependency {name:?} contains a path that is not a managed tree path: {}\n  | reason: {}",
              path.as_string(),
              first_line(&e)
            )));
          }
        };
        match dep.role() {
          Role::Input => {
            inputs.insert(managed, InputRecord { explicit: false, memo: None });
          }
          _ => {
            modified.insert(managed);
          }
        }
      }
    }

    for (path, input) in inputs.iter_mut() {
      input.memo = match read_filesystem_object_memo(&self.tree.native_of(path)) {
        Ok(memo) if memo.stat.as_ref().is_some_and(|s| s.mtime_ns >= redo_start_ns) => {
          debug!(path = %path, "input modified during redo");
          None
        }
        Ok(memo) => encoded_memo(path, &memo),
        Err(e) if e.kind() == io::ErrorKind::NotFound => encoded_memo(path, &FilesystemObjectMemo::non_existent()),
        Err(_) => None,
      };
    }
    for (path, memo) in &self.explicit_inputs {
      inputs.insert(
        path.clone(),
        InputRecord {
          explicit: true,
          memo: encoded_memo(path, memo),
        },
      );
    }

    let record = RunRecord {
      inputs,
      outputs: modified.clone(),
      env: self.env.clone(),
      definitions: self.definitions.clone(),
      parameters_digest: self.parameters_digest.clone(),
      redo_requested,
      updated_at: unix_now(),
    };

    {
      let mut db = lock_db(&self.rundb);
      let invalidated = db.invalidate_inputs_under(&modified, &self.fingerprint);
      if invalidated > 0 {
        debug!(count = invalidated, "invalidated memos of inputs of other runs");
      }
      db.put(&self.fingerprint, record)?;
    }
    self.stats.redos.fetch_add(1, Ordering::Relaxed);

    Ok(Arc::new(RunResult::new(
      self.tool_name.clone(),
      self.fingerprint,
      true,
      values,
    )))
  }
}
