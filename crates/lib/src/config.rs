//! Configuration of a root context.
//!
//! Build scripts usually start from [`Config::from_env`], which reads the `DLB_*` environment
//! variables and falls back to the defaults for unset ones.

use std::time::Duration;

use crate::error::{Error, Result};

pub const MAX_DEPENDENCY_AGE_VAR: &str = "DLB_MAX_DEPENDENCY_AGE";
pub const LATEST_RUN_SUMMARY_MAX_COUNT_VAR: &str = "DLB_LATEST_RUN_SUMMARY_MAX_COUNT";
pub const EXECUTE_HELPER_INHERITS_FILES_VAR: &str = "DLB_EXECUTE_HELPER_INHERITS_FILES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Run database records not updated for longer than this are removed.
  pub max_dependency_age: Duration,
  /// Number of previous run summaries to log on root exit; 0 logs none.
  pub latest_run_summary_max_count: usize,
  /// Number of run summaries kept in the run database.
  pub max_run_summary_count: usize,
  /// Whether helpers executed by a redo inherit stdin, stdout and stderr unless told otherwise.
  pub execute_helper_inherits_files_by_default: bool,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      max_dependency_age: Duration::from_secs(30 * 24 * 60 * 60),
      latest_run_summary_max_count: 0,
      max_run_summary_count: 100,
      execute_helper_inherits_files_by_default: true,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Config> {
    let mut config = Config::default();

    if let Some(value) = var(MAX_DEPENDENCY_AGE_VAR) {
      config.max_dependency_age = humantime::parse_duration(&value).map_err(|e| invalid(MAX_DEPENDENCY_AGE_VAR, &value, e))?;
    }
    if let Some(value) = var(LATEST_RUN_SUMMARY_MAX_COUNT_VAR) {
      config.latest_run_summary_max_count = value
        .parse()
        .map_err(|e| invalid(LATEST_RUN_SUMMARY_MAX_COUNT_VAR, &value, e))?;
    }
    if let Some(value) = var(EXECUTE_HELPER_INHERITS_FILES_VAR) {
      config.execute_helper_inherits_files_by_default = match value.as_str() {
        "1" | "true" | "yes" => true,
        "0" | "false" | "no" => false,
        _ => return Err(invalid(EXECUTE_HELPER_INHERITS_FILES_VAR, &value, "expected a boolean")),
      };
    }

    Ok(config)
  }

  pub(crate) fn check(&self) -> Result<()> {
    if self.max_dependency_age.is_zero() {
      return Err(Error::Config(
        "'max_dependency_age' must be positive\n  | set it to a duration like '30days'".to_string(),
      ));
    }
    Ok(())
  }
}

fn var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(name: &str, value: &str, reason: impl std::fmt::Display) -> Error {
  Error::Config(format!("invalid value of environment variable {name}: {value:?}\n  | reason: {reason}"))
}
