//! Context modifications as synchronization points for pending redos.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dlb::{Context, ContextOptions, Error, Tool, output};

use super::common::{Intervals, copy_tool, enter, sleep_tool, working_tree, write_old};

fn enter_with_lang(dir: &std::path::Path) -> Context {
  Context::enter(ContextOptions {
    root_dir: Some(dir.to_path_buf()),
    max_parallel_redo_count: Some(2),
    outer_env: Some(BTreeMap::from([("LANG".to_string(), "de_CH".to_string())])),
    ..Default::default()
  })
  .unwrap()
}

#[test]
fn modification_completes_pending_redos() {
  let dir = working_tree();
  let intervals: Intervals = Arc::new(Mutex::new(Vec::new()));
  let instance = sleep_tool(intervals.clone(), Duration::from_millis(100))
    .instance()
    .arg("marker_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter_with_lang(dir.path());
  let proxy = instance.start(&ctx, false).unwrap();
  assert!(proxy.is_redo());
  assert!(!dir.path().join("a.o").exists());

  ctx.env().import_from_outer("LANG", "[a-z]{2}_[A-Z]{2}", "sv_SE").unwrap();
  assert!(proxy.is_complete());
  assert!(dir.path().join("a.o").is_file());
  assert_eq!(intervals.lock().unwrap().len(), 1);
  assert!(proxy.complete().unwrap().redo());
  ctx.exit().unwrap();
}

#[test]
fn modification_fails_with_pending_redo_error() {
  let dir = working_tree();
  let tool = Tool::builder("Broken", dlb::location!())
    .dependency("object_file", output::regular_file())
    .redo(|_, _| async { Err(Error::Redo("compiler crashed".to_string())) })
    .build()
    .unwrap();
  let instance = tool.instance().arg("object_file", "a.o").build().unwrap();

  let ctx = enter_with_lang(dir.path());
  let proxy = instance.start(&ctx, false).unwrap();
  let err = ctx.env().import_from_outer("LANG", "[a-z]{2}_[A-Z]{2}", "sv_SE").unwrap_err();
  assert!(err.to_string().contains("compiler crashed"));
  // the error is also available from the proxy
  assert!(matches!(proxy.complete(), Err(Error::Redo(_))));

  // the declaration itself was not made
  assert!(!ctx.env().is_declared("LANG"));
  ctx.exit().unwrap();
}

#[test]
fn only_innermost_context_runs_tools() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "");
  let instance = copy_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  let inner = ctx.nested(ContextOptions::default()).unwrap();
  assert!(matches!(instance.start(&ctx, false), Err(Error::NotRunning(_))));
  assert!(matches!(ctx.nested(ContextOptions::default()), Err(Error::ContextModification(_))));
  assert!(matches!(ctx.temporary(".o", false), Err(Error::ContextModification(_))));
  assert!(instance.run(&inner, false).unwrap().redo());
  inner.exit().unwrap();

  assert!(!instance.run(&ctx, false).unwrap().redo());
  ctx.exit().unwrap();
}

#[test]
fn nested_exit_waits_for_its_redos() {
  let dir = working_tree();
  let intervals: Intervals = Arc::new(Mutex::new(Vec::new()));
  let tool = sleep_tool(intervals.clone(), Duration::from_millis(50));
  let a = tool.instance().arg("marker_file", "a.o").build().unwrap();
  let b = tool.instance().arg("marker_file", "b.o").build().unwrap();

  let ctx = enter_with_lang(dir.path());
  let inner = ctx.nested(ContextOptions::default()).unwrap();
  let pa = a.start(&inner, false).unwrap();
  let pb = b.start(&inner, false).unwrap();
  inner.exit().unwrap();
  assert!(pa.is_complete() && pb.is_complete());
  assert_eq!(intervals.lock().unwrap().len(), 2);
  ctx.exit().unwrap();
}

#[test]
fn summary_counts_runs() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "");
  let instance = copy_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  for _ in 0..2 {
    let ctx = enter(dir.path());
    instance.run(&ctx, false).unwrap();
    instance.run(&ctx, false).unwrap();
    ctx.exit().unwrap();
  }

  let ctx = enter(dir.path());
  let summaries = ctx.summary_of_latest_runs(10).unwrap();
  assert_eq!(summaries.len(), 2);
  assert_eq!((summaries[0].redos, summaries[0].runs_without_redo), (1, 1));
  assert_eq!((summaries[1].redos, summaries[1].runs_without_redo), (0, 2));
  assert!(summaries[0].start_time_ns < summaries[1].start_time_ns);
  assert_eq!(ctx.summary_of_latest_runs(1).unwrap().len(), 1);
  ctx.exit().unwrap();
}
