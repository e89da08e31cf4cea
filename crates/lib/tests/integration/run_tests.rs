//! Running tool instances: redo decisions, results and the run database across contexts.

use std::collections::BTreeMap;
use std::fs;

use dlb::{ContextOptions, Error, Tool, input, output};
use serde_json::json;

use super::common::{copy_tool, enter, enter_with, working_tree, write_old};

#[test]
fn redo_only_when_necessary() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "int main() {}");
  let copy = copy_tool();
  let object = copy.instance().arg("source_file", "a.cpp").arg("object_file", "a.o").build().unwrap();

  let ctx = enter(dir.path());
  let first = object.run(&ctx, false).unwrap();
  assert!(first.redo());
  assert_eq!(fs::read_to_string(dir.path().join("a.o")).unwrap(), "int main() {}");

  assert!(!object.run(&ctx, false).unwrap().redo());

  write_old(dir.path(), "a.cpp", "int main() { return 1; }");
  assert!(object.run(&ctx, false).unwrap().redo());
  assert!(object.run(&ctx, true).unwrap().redo());
  ctx.exit().unwrap();
}

#[test]
fn no_redo_after_restart() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "");
  let object = copy_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  assert!(object.run(&ctx, false).unwrap().redo());
  ctx.exit().unwrap();

  let ctx = enter(dir.path());
  let result = object.run(&ctx, false).unwrap();
  assert!(!result.redo());
  assert_eq!(result.path("object_file").unwrap().as_string(), "a.o");

  let summaries = ctx.summary_of_latest_runs(10).unwrap();
  assert_eq!(summaries.len(), 1);
  assert_eq!(summaries[0].redos, 1);
  ctx.exit().unwrap();
}

#[test]
fn removed_output_is_redone() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "");
  let object = copy_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  object.run(&ctx, false).unwrap();
  fs::remove_file(dir.path().join("a.o")).unwrap();
  assert!(object.run(&ctx, false).unwrap().redo());

  fs::remove_file(dir.path().join("a.o")).unwrap();
  fs::create_dir(dir.path().join("a.o")).unwrap();
  assert!(object.run(&ctx, false).unwrap().redo());
  assert!(dir.path().join("a.o").is_file());
  ctx.exit().unwrap();
}

#[test]
fn several_obstructed_outputs_are_removed() {
  let dir = working_tree();
  let tool = Tool::builder("Pair", dlb::location!())
    .dependency("first_file", output::regular_file())
    .dependency("second_file", output::regular_file())
    .redo(|ctx, result| async move {
      for name in ["first_file", "second_file"] {
        let path = result.get(name)?.single().and_then(|v| v.as_path()).cloned().unwrap();
        fs::write(ctx.native_of(&path), name).unwrap();
      }
      Ok(false)
    })
    .build()
    .unwrap();
  let instance = tool.instance().arg("first_file", "a.o").arg("second_file", "b.o").build().unwrap();
  fs::create_dir_all(dir.path().join("a.o/sub")).unwrap();
  fs::create_dir_all(dir.path().join("b.o/sub")).unwrap();

  let ctx = enter(dir.path());
  assert!(instance.run(&ctx, false).unwrap().redo());
  assert_eq!(fs::read_to_string(dir.path().join("a.o")).unwrap(), "first_file");
  assert_eq!(fs::read_to_string(dir.path().join("b.o")).unwrap(), "second_file");
  ctx.exit().unwrap();
}

#[test]
fn missing_explicit_input_fails_before_redo() {
  let dir = working_tree();
  let object = copy_tool()
    .instance()
    .arg("source_file", "missing.cpp")
    .arg("object_file", "a.o")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  let err = object.start(&ctx, false).err().unwrap();
  assert!(matches!(err, Error::Dependency(_)));
  assert!(err.to_string().contains("non-existent"));
  ctx.exit().unwrap();
}

#[test]
fn output_may_not_be_an_input() {
  let dir = working_tree();
  write_old(dir.path(), "a.cpp", "");
  let object = copy_tool()
    .instance()
    .arg("source_file", "a.cpp")
    .arg("object_file", "a.cpp")
    .build()
    .unwrap();

  let ctx = enter(dir.path());
  assert!(matches!(object.start(&ctx, false), Err(Error::Dependency(_))));
  ctx.exit().unwrap();
}

fn forgetful_tool() -> Tool {
  Tool::builder("Forgetful", dlb::location!())
    .dependency("object_file", output::regular_file().explicit(false))
    .redo(|_, _| async { Ok(false) })
    .build()
    .unwrap()
}

#[test]
fn unassigned_required_result_is_a_redo_error() {
  let dir = working_tree();
  let instance = forgetful_tool().instance().build().unwrap();

  let ctx = enter(dir.path());
  let proxy = instance.start(&ctx, false).unwrap();
  let err = proxy.complete().unwrap_err();
  assert!(matches!(err, Error::Redo(_)));
  assert!(err.to_string().contains("\"object_file\""));
  // same error again, without waiting
  assert!(proxy.is_complete());
  assert!(matches!(proxy.complete(), Err(Error::Redo(_))));

  // a failed redo leaves no record
  assert!(instance.run(&ctx, false).is_err());
  assert!(ctx.exit().is_ok());
}

#[test]
fn redo_may_request_next_redo() {
  let dir = working_tree();
  let tool = Tool::builder("Again", dlb::location!())
    .dependency("object_file", output::regular_file())
    .parameter("AGAIN", json!(true))
    .redo(|ctx, result| async move {
      let object = result.get("object_file")?.single().and_then(|v| v.as_path()).cloned().unwrap();
      fs::write(ctx.native_of(&object), b"").unwrap();
      Ok(true)
    })
    .build()
    .unwrap();
  let instance = tool.instance().arg("object_file", "a.o").build().unwrap();

  let ctx = enter(dir.path());
  assert!(instance.run(&ctx, false).unwrap().redo());
  assert!(instance.run(&ctx, false).unwrap().redo());
  ctx.exit().unwrap();
}

#[test]
fn changed_env_var_forces_redo() {
  let dir = working_tree();
  let tool = Tool::builder("Localized", dlb::location!())
    .dependency(
      "language_code",
      input::env_var("LANG", "(?P<language>[a-z]{2})_[A-Z]{2}", "sv_SE").unwrap().explicit(false),
    )
    .dependency("object_file", output::regular_file())
    .redo(|ctx, result| async move {
      let language = result.get("language_code")?;
      let language = language.single().and_then(|v| v.as_env_var()).unwrap();
      let object = result.get("object_file")?.single().and_then(|v| v.as_path()).cloned().unwrap();
      fs::write(ctx.native_of(&object), &language.groups["language"]).unwrap();
      Ok(false)
    })
    .build()
    .unwrap();
  let instance = tool.instance().arg("object_file", "a.o").build().unwrap();

  let ctx = enter_with(
    dir.path(),
    ContextOptions {
      outer_env: Some(BTreeMap::new()),
      ..Default::default()
    },
  );
  assert!(matches!(instance.start(&ctx, false), Err(Error::EnvVar(_))));

  ctx.env().import_from_outer("LANG", "[a-z]{2}_[A-Z]{2}", "sv_SE").unwrap();
  ctx.env().set("LANG", "de_CH").unwrap();
  assert!(instance.run(&ctx, false).unwrap().redo());
  assert_eq!(fs::read_to_string(dir.path().join("a.o")).unwrap(), "de");
  assert!(!instance.run(&ctx, false).unwrap().redo());

  let inner = ctx.nested(Default::default()).unwrap();
  inner.env().set("LANG", "fr_FR").unwrap();
  let result = instance.run(&inner, false).unwrap();
  assert!(result.redo());
  assert_eq!(result.get("language_code").unwrap().values()[0].as_env_var().unwrap().raw, "fr_FR");
  inner.exit().unwrap();
  ctx.exit().unwrap();
}

#[cfg(unix)]
mod helpers {
  use super::*;
  use dlb::HelperExecution;

  fn shell_tool() -> Tool {
    Tool::builder("Shell", dlb::location!())
      .dependency("object_file", output::regular_file())
      .parameter("SCRIPT", json!("true"))
      .redo(|ctx, result| async move {
        let object = result.get("object_file")?.single().and_then(|v| v.as_path()).cloned().unwrap();
        let script = format!("printf built > {}", object.as_string());
        let (_, stdout) = ctx
          .execute_helper_with_output("sh", ["-c", "pwd"], HelperExecution::default())
          .await?;
        assert!(!stdout.is_empty());
        ctx.execute_helper("sh", ["-c", script.as_str()]).await?;
        Ok(false)
      })
      .build()
      .unwrap()
  }

  #[test]
  fn helper_runs_in_working_tree_root() {
    let dir = working_tree();
    let instance = shell_tool().instance().arg("object_file", "a.o").build().unwrap();
    let ctx = enter(dir.path());
    assert!(instance.run(&ctx, false).unwrap().redo());
    assert_eq!(fs::read_to_string(dir.path().join("a.o")).unwrap(), "built");
    ctx.exit().unwrap();
  }

  #[test]
  fn unexpected_exit_code_fails_redo() {
    let dir = working_tree();
    let tool = Tool::builder("Failing", dlb::location!())
      .dependency("object_file", output::regular_file())
      .redo(|ctx, _| async move {
        ctx.execute_helper("sh", ["-c", "exit 3"]).await?;
        Ok(false)
      })
      .build()
      .unwrap();
    let instance = tool.instance().arg("object_file", "a.o").build().unwrap();

    let ctx = enter(dir.path());
    let err = instance.run(&ctx, false).unwrap_err();
    assert!(matches!(err, Error::HelperExecution { .. }));
    assert!(err.to_string().contains("exit code 3"));
    ctx.exit().unwrap();
  }

  #[test]
  fn unknown_helper() {
    let dir = working_tree();
    let tool = Tool::builder("Unknown", dlb::location!())
      .dependency("object_file", output::regular_file())
      .redo(|ctx, _| async move {
        ctx.execute_helper("no-such-helper-xyz", Vec::<String>::new()).await?;
        Ok(false)
      })
      .build()
      .unwrap();
    let instance = tool.instance().arg("object_file", "a.o").build().unwrap();

    let ctx = enter(dir.path());
    assert!(matches!(instance.run(&ctx, false), Err(Error::Helper(_))));
    ctx.exit().unwrap();
  }
}
