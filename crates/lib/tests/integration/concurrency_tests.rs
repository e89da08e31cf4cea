//! Parallel redos bounded by `max_parallel_redo_count`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dlb::ContextOptions;

use super::common::{Intervals, enter_with, sleep_tool, working_tree};

fn run_two(max_parallel_redo_count: usize) -> Vec<(std::time::Instant, std::time::Instant)> {
  let dir = working_tree();
  let intervals: Intervals = Arc::new(Mutex::new(Vec::new()));
  let tool = sleep_tool(intervals.clone(), Duration::from_millis(200));
  let first = tool.instance().arg("marker_file", "1.o").build().unwrap();
  let second = tool.instance().arg("marker_file", "2.o").build().unwrap();

  let ctx = enter_with(
    dir.path(),
    ContextOptions {
      max_parallel_redo_count: Some(max_parallel_redo_count),
      ..Default::default()
    },
  );
  let a = first.start(&ctx, false).unwrap();
  let b = second.start(&ctx, false).unwrap();
  assert!(a.is_redo() && b.is_redo());
  a.complete().unwrap();
  b.complete().unwrap();
  ctx.exit().unwrap();

  assert!(dir.path().join("1.o").is_file());
  assert!(dir.path().join("2.o").is_file());
  let mut intervals = intervals.lock().unwrap().clone();
  intervals.sort();
  assert_eq!(intervals.len(), 2);
  intervals
}

#[test]
fn sequential_redos() {
  let intervals = run_two(1);
  assert!(intervals[1].0 >= intervals[0].1);
}

#[test]
fn parallel_redos() {
  let intervals = run_two(2);
  assert!(intervals[1].0 < intervals[0].1);
}

#[test]
fn same_instance_waits_for_pending_redo() {
  let dir = working_tree();
  let intervals: Intervals = Arc::new(Mutex::new(Vec::new()));
  let tool = sleep_tool(intervals.clone(), Duration::from_millis(50));
  let instance = tool.instance().arg("marker_file", "1.o").build().unwrap();

  let ctx = enter_with(
    dir.path(),
    ContextOptions {
      max_parallel_redo_count: Some(4),
      ..Default::default()
    },
  );
  let first = instance.start(&ctx, false).unwrap();
  let second = instance.start(&ctx, false).unwrap();
  // the second start saw the result of the first redo
  assert!(first.is_complete());
  assert!(!second.is_redo());
  assert_eq!(intervals.lock().unwrap().len(), 1);
  ctx.exit().unwrap();
}
