//! Why a redo is necessary: changed, removed and unknown inputs.

use std::fs;

use dlb::rundb::RunDatabase;
use tracing_test::traced_test;

use super::common::{compile_tool, copy_tool, enter, working_tree, write_old};

#[test]
#[traced_test]
fn changed_non_explicit_input() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "#include \"a.h\"");
  write_old(dir.path(), "a.h", "");
  write_old(dir.path(), "b.h", "");
  let compile = compile_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  let result = compile.run(&ctx, false).unwrap();
  assert!(result.redo());
  let includes: Vec<String> = result.paths("include_files").iter().map(|p| p.as_string()).collect();
  assert_eq!(includes, ["a.h", "b.h"]);
  assert!(!compile.run(&ctx, false).unwrap().redo());

  write_old(dir.path(), "a.h", "#define A 1");
  assert!(compile.run(&ctx, false).unwrap().redo());
  assert!(logs_contain("redo necessary because of filesystem object: \"a.h\""));

  fs::remove_file(dir.path().join("b.h")).unwrap();
  let result = compile.run(&ctx, false).unwrap();
  assert!(result.redo());
  assert!(logs_contain("non-existent filesystem object: \"b.h\""));
  assert_eq!(result.paths("include_files").len(), 1);

  assert!(!compile.run(&ctx, false).unwrap().redo());
  ctx.exit().unwrap();
}

#[test]
#[traced_test]
fn unknown_recorded_state() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "");
  write_old(dir.path(), "a.h", "");
  let compile = compile_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  compile.run(&ctx, false).unwrap();
  ctx.exit().unwrap();

  let mut db = RunDatabase::open(&dir.path().join(".dlbroot")).unwrap();
  let mut record = db.get(compile.fingerprint()).cloned().unwrap();
  let input = record.inputs.get_mut(&dlb::Path::new("a.h").unwrap()).unwrap();
  assert!(!input.explicit);
  input.memo = Some("0badc0de".to_string());
  db.put(compile.fingerprint(), record).unwrap();
  drop(db);

  let ctx = enter(dir.path());
  assert!(compile.run(&ctx, false).unwrap().redo());
  assert!(logs_contain("state before last successful redo is unknown"));
  assert!(!compile.run(&ctx, false).unwrap().redo());
  ctx.exit().unwrap();
}

#[test]
fn output_of_one_instance_is_input_of_another() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "first");
  let copy = copy_tool();
  let generate = copy.instance().arg("source_file", "a.cpp").arg("object_file", "b.cpp").build().unwrap();
  let compile = copy.instance().arg("source_file", "b.cpp").arg("object_file", "b.o").build().unwrap();

  let ctx = enter(dir.path());
  assert!(generate.run(&ctx, false).unwrap().redo());
  assert!(compile.run(&ctx, false).unwrap().redo());
  assert!(!generate.run(&ctx, false).unwrap().redo());
  assert!(!compile.run(&ctx, false).unwrap().redo());

  write_old(dir.path(), "a.cpp", "second!");
  assert!(generate.run(&ctx, false).unwrap().redo());
  assert!(compile.run(&ctx, false).unwrap().redo());
  assert_eq!(fs::read_to_string(dir.path().join("b.o")).unwrap(), "second!");
  ctx.exit().unwrap();
}
