//! Integration tests: tools run in contexts on real working trees.

mod common;
mod concurrency_tests;
mod context_tests;
mod run_tests;
mod staleness_tests;
