use predicates::prelude::*;
use serde_json::{Value, json};

use super::common::{TestEnv, sh_step, staged};

/// `compile` reads a source file, `package` reads compile's output.
fn two_step_env() -> TestEnv {
  let env = TestEnv::with_steps(json!([
    staged(
      sh_step(
        "compile",
        r#"read -r line < src.txt; printf '%s compiled\n' "$line" > "$out/lib.txt""#,
        json!([{ "kind": "file", "path": "src.txt" }]),
        &["lib.txt"],
      ),
      "build",
    ),
    staged(
      sh_step(
        "package",
        r#"read -r line < lib.txt; printf '%s packaged\n' "$line" > "$out/app.txt""#,
        json!([{ "kind": "step", "id": "compile" }]),
        &["app.txt"],
      ),
      "release",
    ),
  ]));
  env.write_file("src.txt", "hello\n");
  env
}

#[test]
fn build_executes_then_reuses_cache() {
  let env = two_step_env();

  env
    .build(&[])
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete"))
    .stdout(predicate::str::contains("Executed: 2"));

  env
    .build(&[])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 0"))
    .stdout(predicate::str::contains("Cached: 2"));
}

#[test]
fn changed_source_reruns_dependent_steps() {
  let env = two_step_env();
  env.build(&[]).assert().success();

  env.write_file("src.txt", "changed\n");
  env
    .build(&[])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 2"));
}

#[test]
fn out_exports_last_stage_by_default() {
  let env = two_step_env();
  let out = env.output_path();

  env.build(&["--out", out.to_str().unwrap()]).assert().success();

  assert_eq!(
    std::fs::read_to_string(out.join("app.txt")).unwrap(),
    "hello compiled packaged\n"
  );
  assert!(!out.join("lib.txt").exists());
}

#[test]
fn out_exports_selected_stages() {
  let env = two_step_env();
  let out = env.output_path();

  env
    .build(&["--out", out.to_str().unwrap(), "--stage", "build", "--stage", "release"])
    .assert()
    .success();

  assert!(out.join("lib.txt").exists());
  assert!(out.join("app.txt").exists());
}

#[test]
fn unknown_stage_fails() {
  let env = two_step_env();
  let out = env.output_path();

  env
    .build(&["--out", out.to_str().unwrap(), "--stage", "nope"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("nope"));
}

#[test]
fn failing_step_fails_build_and_skips_dependents() {
  let env = TestEnv::with_steps(json!([
    sh_step("broken", "exit 3", json!([]), &["x"]),
    sh_step(
      "after",
      r#"printf x > "$out/y""#,
      json!([{ "kind": "step", "id": "broken" }]),
      &["y"]
    ),
    sh_step("independent", r#"printf ok > "$out/z""#, json!([]), &["z"]),
  ]));

  env
    .build(&[])
    .assert()
    .failure()
    .stderr(predicate::str::contains("broken"))
    .stderr(predicate::str::contains("Build failed: 2 step(s) failed"))
    .stdout(predicate::str::contains("Executed: 1"));
}

#[test]
fn missing_declared_output_fails() {
  let env = TestEnv::with_steps(json!([sh_step(
    "lazy",
    r#"printf x > "$out/other""#,
    json!([]),
    &["expected"]
  )]));

  env
    .build(&[])
    .assert()
    .failure()
    .stderr(predicate::str::contains("expected"));
}

#[test]
fn cycle_is_rejected_before_running() {
  let env = TestEnv::with_steps(json!([
    sh_step("a", "exit 0", json!([{ "kind": "step", "id": "b" }]), &["a"]),
    sh_step("b", "exit 0", json!([{ "kind": "step", "id": "a" }]), &["b"]),
  ]));

  env
    .build(&[])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid build"));
}

#[test]
fn json_output_lists_steps() {
  let env = two_step_env();

  let output = env.build(&["-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(summary["success"], json!(true));
  assert_eq!(summary["executed"], json!(2));
  let steps = summary["steps"].as_array().unwrap();
  assert_eq!(steps.len(), 2);
  assert_eq!(steps[0]["id"], json!("compile"));
  assert_eq!(steps[0]["status"], json!("done"));
  assert_eq!(steps[0]["fingerprint"].as_str().unwrap().len(), 64);
}

#[test]
fn timeout_fails_slow_step() {
  // A busy loop needs no tools from PATH.
  let env = TestEnv::with_steps(json!([sh_step(
    "slow",
    r#"while :; do :; done"#,
    json!([]),
    &["never"]
  )]));

  env
    .build(&["--step-timeout", "300ms"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("timed out"));
}
