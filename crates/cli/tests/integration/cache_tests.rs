use predicates::prelude::*;
use serde_json::{Value, json};

use super::common::TestEnv;

#[test]
fn stats_on_empty_cache() {
  let env = TestEnv::new();

  env
    .strata_cmd()
    .args(["cache", "stats"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries: 0"));
}

#[test]
fn stats_json_output_is_valid() {
  let env = TestEnv::new();

  let output = env.strata_cmd().args(["cache", "stats", "-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let stats: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(stats["entries"], json!(0));
  assert_eq!(stats["bytes"], json!(0));
}

#[test]
fn gc_dry_run_shows_what_would_be_removed() {
  let env = TestEnv::new();

  env
    .strata_cmd()
    .args(["cache", "gc", "--max-size", "0", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
}

#[test]
fn gc_by_age_succeeds() {
  let env = TestEnv::new();

  env
    .strata_cmd()
    .args(["cache", "gc", "--max-age", "7days"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Cache cleanup complete"));
}

#[cfg(unix)]
mod with_entries {
  use super::*;
  use crate::common::sh_step;

  fn built_env() -> TestEnv {
    let env = TestEnv::with_steps(json!([
      sh_step("one", r#"printf 1 > "$out/one""#, json!([]), &["one"]),
      sh_step("two", r#"printf 22 > "$out/two""#, json!([]), &["two"]),
    ]));
    env.build(&[]).assert().success();
    env
  }

  #[test]
  fn stats_counts_built_entries() {
    let env = built_env();

    let output = env.strata_cmd().args(["cache", "stats", "-o", "json"]).output().unwrap();
    let stats: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["entries"], json!(2));
    assert_eq!(stats["bytes"], json!(3));
  }

  #[test]
  fn gc_dry_run_keeps_entries() {
    let env = built_env();

    let output = env
      .strata_cmd()
      .args(["cache", "gc", "--max-size", "0", "--dry-run", "-o", "json"])
      .output()
      .unwrap();
    let result: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["dry_run"], json!(true));
    assert_eq!(result["evicted"].as_array().unwrap().len(), 2);

    env
      .build(&[])
      .assert()
      .success()
      .stdout(predicate::str::contains("Cached: 2"));
  }

  #[test]
  fn gc_evicts_and_forces_rebuild() {
    let env = built_env();

    env
      .strata_cmd()
      .args(["cache", "gc", "--max-size", "0"])
      .assert()
      .success()
      .stdout(predicate::str::contains("Entries removed: 2"));

    env
      .build(&[])
      .assert()
      .success()
      .stdout(predicate::str::contains("Executed: 2"));
  }
}
