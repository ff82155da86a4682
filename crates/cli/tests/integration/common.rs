//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the build context,
/// the build file and the cache.
pub struct TestEnv {
  pub temp: TempDir,
  pub build_path: PathBuf,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let build_path = temp.path().join("project").join("build.json");
    std::fs::create_dir_all(build_path.parent().unwrap()).unwrap();
    Self { temp, build_path }
  }

  /// Create with `steps` written as the build file.
  pub fn with_steps(steps: Value) -> Self {
    let env = Self::new();
    env.write_build(steps);
    env
  }

  pub fn write_build(&self, steps: Value) {
    let content = serde_json::to_string_pretty(&json!({ "steps": steps })).unwrap();
    std::fs::write(&self.build_path, content).unwrap();
  }

  /// Write a file relative to the build context.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.context_path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn context_path(&self) -> &Path {
    self.build_path.parent().unwrap()
  }

  /// Cache root (isolated per test).
  pub fn cache_path(&self) -> PathBuf {
    let p = self.temp.path().join("cache");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn output_path(&self) -> PathBuf {
    self.temp.path().join("output")
  }

  /// Get a pre-configured Command for the strata binary.
  ///
  /// `STRATA_CACHE_DIR` points at the isolated cache root.
  pub fn strata_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("strata");
    cmd.env("STRATA_CACHE_DIR", self.cache_path());
    cmd
  }

  /// `strata build <file>` with extra arguments.
  pub fn build(&self, args: &[&str]) -> Command {
    let mut cmd = self.strata_cmd();
    cmd.arg("build").arg(&self.build_path).args(args);
    cmd
  }
}

/// An exec step running `script` under `/bin/sh`.
///
/// The sandbox has no `PATH`, so scripts stick to shell builtins.
pub fn sh_step(id: &str, script: &str, inputs: Value, outputs: &[&str]) -> Value {
  json!({
    "id": id,
    "inputs": inputs,
    "action": { "type": "exec", "bin": "/bin/sh", "args": ["-c", script] },
    "outputs": outputs,
  })
}

/// Same as [`sh_step`], assigned to `stage`.
pub fn staged(mut step: Value, stage: &str) -> Value {
  step["stage"] = json!(stage);
  step
}
