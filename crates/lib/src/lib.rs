//! dlb: incremental builds from typed tool definitions.
//!
//! A build script defines [`Tool`]s with typed dependency roles, creates [`ToolInstance`]s with
//! concrete values and runs them in a [`Context`]. A run executes the tool's redo only if the
//! state recorded by the last successful redo of the same instance is no longer current:
//!
//! - `depend`: dependency roles and validation of their values
//! - `tool`: tool definitions, instances, fingerprints, `start()` and `run()`
//! - `redo`: the redo decision
//! - `rundb`, `memo`: the run database of a working tree and the filesystem memos it stores
//! - `context`: the context stack, its environment variables and helpers
//! - `sequence`: bounded-concurrency execution of redos
//! - `worktree`: management tree, lock, working tree time and temporaries

pub mod config;
pub mod context;
pub mod depend;
pub mod diagnostics;
pub mod error;
pub mod fs;
pub mod memo;
pub mod mult;
pub mod redo;
pub mod rundb;
pub mod sequence;
pub mod tool;
pub mod toolrun;
pub mod worktree;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use context::{Context, ContextOptions};
pub use depend::{Concrete, Dependency, Raw, Value, input, intermediate, output};
pub use error::{Error, Result};
pub use fs::{Path, PathClass};
pub use mult::Multiplicity;
pub use tool::{DefinitionLocation, Fingerprint, Tool, ToolInstance};
pub use toolrun::{HelperExecution, RedoContext, RedoResult, ResultProxy, RunResult};
