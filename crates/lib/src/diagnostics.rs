//! Console logging for build scripts.

use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_VAR: &str = "DLB_LOG";

/// Installs a `tracing` subscriber that writes to stderr, filtered by `DLB_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging() {
  let filter = EnvFilter::try_from_env(LOG_FILTER_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .without_time()
    .with_target(false)
    .with_writer(std::io::stderr)
    .try_init();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn init_twice_is_harmless() {
    init_logging();
    init_logging();
    tracing::info!("still logging");
  }
}
