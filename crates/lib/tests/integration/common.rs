//! Shared test helpers: working trees and a few tools.

use std::fs;
use std::path::Path as NativePath;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use dlb::{Context, ContextOptions, Multiplicity, Tool, input, output};
use tempfile::TempDir;

/// A working tree in a new temporary directory.
pub fn working_tree() -> TempDir {
  let dir = TempDir::new().unwrap();
  fs::create_dir(dir.path().join(".dlbroot")).unwrap();
  dir
}

pub fn enter(dir: &NativePath) -> Context {
  enter_with(dir, ContextOptions::default())
}

pub fn enter_with(dir: &NativePath, options: ContextOptions) -> Context {
  Context::enter(ContextOptions {
    root_dir: Some(dir.to_path_buf()),
    ..options
  })
  .unwrap()
}

/// Writes `content` to `dir/rel` and backdates its mtime, so that it is older than any
/// working tree time of the test.
pub fn write_old(dir: &NativePath, rel: &str, content: &str) {
  let path = dir.join(rel);
  fs::write(&path, content).unwrap();
  let file = fs::File::options().write(true).open(&path).unwrap();
  file.set_modified(SystemTime::now() - Duration::from_secs(60)).unwrap();
}

/// `source_file` → `object_file`: copies the content.
pub fn copy_tool() -> Tool {
  Tool::builder("Copy", dlb::location!())
    .dependency("source_file", input::regular_file())
    .dependency("object_file", output::regular_file())
    .redo(|ctx, result| async move {
      let source = result.get("source_file")?;
      let object = result.get("object_file")?;
      let source = source.single().and_then(|v| v.as_path()).unwrap();
      let object = object.single().and_then(|v| v.as_path()).unwrap();

      let temporary = ctx.temporary(".o", false)?;
      fs::copy(ctx.native_of(source), temporary.native()).unwrap();
      ctx.replace_output(object, temporary.path())?;
      Ok(false)
    })
    .build()
    .unwrap()
}

/// `source_file` + non-explicit `include_files` (all `*.h` next to the source) → `object_file`.
pub fn compile_tool() -> Tool {
  Tool::builder("Compile", dlb::location!())
    .dependency("source_file", input::regular_file())
    .dependency(
      "include_files",
      input::regular_file().multiplicity(Multiplicity::at_least(0)).explicit(false),
    )
    .dependency("object_file", output::regular_file())
    .redo(|ctx, result| async move {
      let source = result.get("source_file")?.single().and_then(|v| v.as_path()).cloned().unwrap();
      let object = result.get("object_file")?.single().and_then(|v| v.as_path()).cloned().unwrap();
      let mut includes: Vec<String> = fs::read_dir(ctx.native_of(&dlb::Path::dir(".").unwrap()))
        .unwrap()
        .filter_map(|e| e.ok()?.file_name().into_string().ok())
        .filter(|n| n.ends_with(".h"))
        .collect();
      includes.sort();
      result.set("include_files", includes)?;
      fs::write(ctx.native_of(&object), fs::read(ctx.native_of(&source)).unwrap()).unwrap();
      Ok(false)
    })
    .build()
    .unwrap()
}

/// Intervals during which redos of [`sleep_tool`] ran.
pub type Intervals = Arc<Mutex<Vec<(Instant, Instant)>>>;

/// Sleeps for `duration` and then writes `marker_file`.
pub fn sleep_tool(intervals: Intervals, duration: Duration) -> Tool {
  Tool::builder("Sleep", dlb::location!())
    .dependency("marker_file", output::regular_file())
    .redo(move |ctx, result| {
      let intervals = intervals.clone();
      async move {
        let started = Instant::now();
        tokio::time::sleep(duration).await;
        let marker = result.get("marker_file")?.single().and_then(|v| v.as_path()).cloned().unwrap();
        fs::write(ctx.native_of(&marker), b"").unwrap();
        intervals.lock().unwrap().push((started, Instant::now()));
        Ok(false)
      }
    })
    .build()
    .unwrap()
}
