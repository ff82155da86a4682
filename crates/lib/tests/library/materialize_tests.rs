use strata_lib::materialize::{MaterializeError, materialize};

use super::common::{Harness, RecordingExecutor, config, emit};

#[tokio::test]
async fn later_stage_overlays_earlier_stage() {
  let harness = Harness::new();
  let mut scheduler = harness.scheduler(
    vec![
      emit("base", &["etc/app.conf", "bin/"]).stage("base"),
      emit("runtime", &["etc/app.conf"]).stage("runtime").after("base"),
    ],
    RecordingExecutor::new(),
    config(2),
  );
  let report = scheduler.run().await;

  let result = materialize(scheduler.graph(), &report, &["runtime", "base"]).unwrap();

  assert_eq!(
    result.artifact().get("etc/app.conf"),
    Some(&b"runtime:etc/app.conf"[..])
  );
  assert_eq!(result.artifact().get("bin/index"), Some(&b"base:bin/"[..]));
  assert_eq!(result.source("etc/app.conf").map(|s| s.as_str()), Some("runtime"));

  let out = tempfile::tempdir().unwrap();
  result.write_to(out.path()).unwrap();
  assert_eq!(
    std::fs::read_to_string(out.path().join("etc/app.conf")).unwrap(),
    "runtime:etc/app.conf"
  );
}

#[tokio::test]
async fn stage_with_failed_step_cannot_be_materialized() {
  let harness = Harness::new();
  let mut scheduler = harness.scheduler(
    vec![
      emit("base", &["bin/"]).stage("base"),
      emit("assets", &["public/"]).stage("runtime"),
    ],
    RecordingExecutor::new().failing("assets"),
    config(2),
  );
  let report = scheduler.run().await;

  assert!(materialize(scheduler.graph(), &report, &["base"]).is_ok());
  let err = materialize(scheduler.graph(), &report, &["runtime"]).unwrap_err();
  assert!(matches!(err, MaterializeError::MissingOutput { ref stage, .. } if stage == "runtime"));
}
