use std::sync::Arc;
use std::time::Duration;

use strata_lib::cache::{CacheError, CacheMounts, CacheStore, EvictionPolicy, LockMode};
use strata_lib::execute::{ExecuteConfig, ExecuteError, Scheduler, StepError};
use strata_lib::graph::GraphError;
use strata_lib::step::{InputRef, StepStatus};

use super::common::{Harness, RecordingExecutor, config, emit};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_steps_run_concurrently_most_expensive_first() {
  let harness = Harness::new();
  // Each action blocks until all three are running, so a serial run would hang.
  let executor = RecordingExecutor::new().rendezvous(3);
  let mut scheduler = harness.scheduler(
    vec![
      emit("install-pg", &["pg/"]).cost(3),
      emit("install-gems", &["vendor/"]).cost(10),
      emit("install-node", &["node_modules/"]).cost(8),
    ],
    executor.clone(),
    config(3),
  );

  let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
    .await
    .expect("steps did not run concurrently");

  assert!(report.is_success());
  let order: Vec<&str> = report.dispatch_order.iter().map(|id| id.as_str()).collect();
  assert_eq!(order, vec!["install-gems", "install-node", "install-pg"]);
  assert_eq!(report.executed_count(), 3);
}

#[tokio::test]
async fn ties_dispatch_in_declaration_order() {
  let harness = Harness::new();
  let mut scheduler = harness.scheduler(
    vec![emit("b", &["b"]), emit("a", &["a"]), emit("c", &["c"])],
    RecordingExecutor::new(),
    config(1),
  );

  let report = scheduler.run().await;
  let order: Vec<&str> = report.dispatch_order.iter().map(|id| id.as_str()).collect();
  assert_eq!(order, vec!["b", "a", "c"]);
}

#[tokio::test]
async fn dependents_wait_for_producers_and_see_their_outputs() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new();
  let mut scheduler = harness.scheduler(
    vec![
      emit("app", &["app/"]).after("gems").after("assets"),
      emit("gems", &["vendor/"]),
      emit("assets", &["public/"]).after("gems").cost(50),
    ],
    executor.clone(),
    config(4),
  );

  let report = scheduler.run().await;

  assert!(report.is_success());
  assert_eq!(executor.executed(), vec!["gems", "assets", "app"]);
  let app = executor.calls().into_iter().find(|c| c.step == "app").unwrap();
  assert_eq!(app.upstream, vec!["gems", "assets"]);
  assert_eq!(
    report.output("app").unwrap().get("app/index"),
    Some(&b"app:app/"[..])
  );
}

#[tokio::test]
async fn stage_inputs_depend_on_every_stage_step() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new();
  let mut scheduler = harness.scheduler(
    vec![
      emit("gems", &["vendor/"]).stage("deps"),
      emit("yarn", &["node_modules/"]).stage("deps"),
      emit("app", &["app"]).input(InputRef::Stage { name: "deps".into() }),
    ],
    executor.clone(),
    config(2),
  );

  let report = scheduler.run().await;

  assert!(report.is_success());
  assert_eq!(executor.executed().last().map(String::as_str), Some("app"));
  let app = executor.calls().into_iter().find(|c| c.step == "app").unwrap();
  assert_eq!(app.upstream, vec!["gems", "yarn"]);
}

#[tokio::test]
async fn rerun_with_populated_cache_executes_nothing() {
  let harness = Harness::new();
  let steps = vec![
    emit("gems", &["vendor/"]),
    emit("assets", &["public/"]).after("gems"),
    emit("app", &["app"]).after("assets"),
  ];

  let first = RecordingExecutor::new();
  let report = harness.scheduler(steps.clone(), first.clone(), config(2)).run().await;
  assert_eq!(report.executed_count(), 3);

  let second = RecordingExecutor::new();
  let report = harness.scheduler(steps, second.clone(), config(2)).run().await;

  assert!(second.executed().is_empty());
  assert_eq!(report.cached_count(), 3);
  assert!(report.steps.iter().all(|s| s.status == StepStatus::Cached));
  assert_eq!(
    report.output("app").unwrap().get("app"),
    Some(&b"app:app"[..])
  );
}

#[tokio::test]
async fn changed_file_reruns_only_affected_steps() {
  let harness = Harness::new();
  harness.write("Gemfile.lock", "rails 7.1");
  harness.write("package.json", "{}");
  let steps = vec![
    emit("gems", &["vendor/"]).file("Gemfile.lock"),
    emit("app", &["app"]).after("gems"),
    emit("yarn", &["node_modules/"]).file("package.json"),
  ];

  let first = harness.scheduler(steps.clone(), RecordingExecutor::new(), config(2));
  let before: Vec<_> = first.fingerprints().to_vec();
  drop(first);
  harness
    .scheduler(steps.clone(), RecordingExecutor::new(), config(2))
    .run()
    .await;

  harness.write("Gemfile.lock", "rails 7.2");
  let executor = RecordingExecutor::new();
  let mut scheduler = harness.scheduler(steps, executor.clone(), config(2));
  let after = scheduler.fingerprints().to_vec();
  let report = scheduler.run().await;

  assert_ne!(before[0], after[0]);
  assert_ne!(before[1], after[1]);
  assert_eq!(before[2], after[2]);

  let mut executed = executor.executed();
  executed.sort();
  assert_eq!(executed, vec!["app", "gems"]);
  assert_eq!(report.status("yarn"), Some(StepStatus::Cached));
}

#[tokio::test]
async fn failure_fails_dependents_without_running_them() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new().failing("gems");
  let mut scheduler = harness.scheduler(
    vec![
      emit("gems", &["vendor/"]),
      emit("app", &["app"]).after("gems"),
      emit("release", &["release"]).after("app"),
      emit("yarn", &["node_modules/"]),
    ],
    executor.clone(),
    config(2),
  );

  let report = scheduler.run().await;

  assert!(!report.is_success());
  assert_eq!(report.status("gems"), Some(StepStatus::Failed));
  assert!(matches!(
    report.step("gems").unwrap().error,
    Some(StepError::ActionExecution(_))
  ));
  for id in ["app", "release"] {
    let step = report.step(id).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(
      matches!(&step.error, Some(StepError::DependencyFailed { dependency }) if dependency.as_str() == "gems"),
      "{id}: {:?}",
      step.error
    );
  }
  assert_eq!(report.status("yarn"), Some(StepStatus::Done));

  let mut executed = executor.executed();
  executed.sort();
  assert_eq!(executed, vec!["gems", "yarn"]);
}

#[tokio::test]
async fn failed_steps_are_not_cached() {
  let harness = Harness::new();
  let steps = vec![emit("gems", &["vendor/"])];

  harness
    .scheduler(steps.clone(), RecordingExecutor::new().failing("gems"), config(1))
    .run()
    .await;
  assert_eq!(harness.cache.stats().unwrap().entries, 0);

  let retry = RecordingExecutor::new();
  let report = harness.scheduler(steps, retry.clone(), config(1)).run().await;
  assert_eq!(retry.executed(), vec!["gems"]);
  assert_eq!(report.status("gems"), Some(StepStatus::Done));
}

#[tokio::test]
async fn missing_declared_output_fails_the_step() {
  let harness = Harness::new();
  let mut scheduler = harness.scheduler(
    vec![emit("gems", &["vendor/", "Gemfile.lock"])],
    RecordingExecutor::new().omitting("gems"),
    config(1),
  );

  let report = scheduler.run().await;

  assert!(matches!(
    &report.step("gems").unwrap().error,
    Some(StepError::MissingDeclaredOutput { path }) if path == "vendor/"
  ));
  assert_eq!(harness.cache.stats().unwrap().entries, 0);
}

#[tokio::test]
async fn step_timeout_fails_with_timeout() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new().delayed("gems", Duration::from_secs(30));
  let mut scheduler = harness.scheduler(
    vec![emit("gems", &["vendor/"]), emit("yarn", &["node_modules/"])],
    executor,
    ExecuteConfig {
      max_parallel: 2,
      step_timeout: Some(Duration::from_millis(100)),
      ..ExecuteConfig::default()
    },
  );

  let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
    .await
    .expect("timeout was not enforced");

  assert!(matches!(
    report.step("gems").unwrap().error,
    Some(StepError::Timeout { after }) if after == Duration::from_millis(100)
  ));
  assert_eq!(report.status("yarn"), Some(StepStatus::Done));
}

#[tokio::test]
async fn fail_fast_stops_dispatching() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new().failing("gems");
  let mut scheduler = harness.scheduler(
    vec![
      emit("gems", &["vendor/"]).cost(10),
      emit("yarn", &["node_modules/"]).cost(5),
      emit("pg", &["pg/"]).cost(1),
      emit("app", &["app"]).after("yarn"),
    ],
    executor.clone(),
    ExecuteConfig {
      max_parallel: 1,
      fail_fast: true,
      ..ExecuteConfig::default()
    },
  );

  let report = scheduler.run().await;

  assert_eq!(executor.executed(), vec!["gems"]);
  assert_eq!(report.status("gems"), Some(StepStatus::Failed));
  assert_eq!(report.status("yarn"), Some(StepStatus::Ready));
  assert_eq!(report.status("pg"), Some(StepStatus::Ready));
  assert_eq!(report.status("app"), Some(StepStatus::Pending));
  assert_eq!(report.not_started().count(), 3);
  assert_eq!(report.dispatch_order.len(), 1);
}

#[tokio::test]
async fn fail_fast_cancels_steps_already_in_flight() {
  let harness = Harness::new();
  let mounts = Arc::new(CacheMounts::ephemeral().unwrap());
  let held = mounts.acquire("bundler").await.unwrap();

  let executor = RecordingExecutor::new().failing("broken");
  let mut scheduler = harness
    .scheduler(
      vec![
        emit("gems", &["vendor/"])
          .input(InputRef::CacheMount { id: "bundler".into() })
          .cost(10),
        emit("broken", &["x"]).cost(5),
        emit("pg", &["pg/"]).cost(1),
      ],
      executor.clone(),
      ExecuteConfig {
        max_parallel: 2,
        fail_fast: true,
        ..ExecuteConfig::default()
      },
    )
    .with_mounts(mounts.clone());

  // `gems` is dispatched but parked on the mount until well after `broken` failed.
  let (report, ()) = tokio::join!(scheduler.run(), async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(held);
  });

  assert_eq!(executor.executed(), vec!["broken"]);
  assert_eq!(report.status("gems"), Some(StepStatus::Failed));
  assert!(matches!(report.step("gems").unwrap().error, Some(StepError::Cancelled)));
  assert_eq!(report.status("broken"), Some(StepStatus::Failed));
  assert_eq!(report.status("pg"), Some(StepStatus::Ready));
  let dispatched: Vec<&str> = report.dispatch_order.iter().map(|id| id.as_str()).collect();
  assert_eq!(dispatched, vec!["gems", "broken"]);
}

#[tokio::test]
async fn post_run_eviction_needs_an_exclusive_store() {
  let root = tempfile::TempDir::new().unwrap();
  let lru = ExecuteConfig {
    eviction_policy: EvictionPolicy::LeastRecentlyUsed { max_bytes: 0 },
    ..config(2)
  };
  let steps = || vec![emit("gems", &["vendor/"]), emit("yarn", &["node_modules/"])];

  let shared = Harness::with_cache(CacheStore::open(root.path(), LockMode::Shared, "build").unwrap());
  let report = shared.scheduler(steps(), RecordingExecutor::new(), lru.clone()).run().await;
  assert!(report.is_success());
  assert!(report.eviction.is_none());
  assert_eq!(shared.cache.stats().unwrap().entries, 2);
  drop(shared);

  let exclusive = Harness::with_cache(CacheStore::open(root.path(), LockMode::Exclusive, "build").unwrap());
  let report = exclusive.scheduler(steps(), RecordingExecutor::new(), lru).run().await;
  assert_eq!(report.cached_count(), 2);
  let eviction = report.eviction.expect("exclusive store evicts after the run");
  assert_eq!(eviction.evicted.len(), 2);
  assert_eq!(eviction.remaining_entries, 0);
  assert_eq!(exclusive.cache.stats().unwrap().entries, 0);
}

#[tokio::test]
async fn storage_full_is_a_distinct_step_failure() {
  let harness = Harness::with_cache(CacheStore::in_memory().with_capacity(4));
  let mut scheduler = harness.scheduler(
    vec![
      emit("gems", &["vendor/"]),
      emit("app", &["app"]).after("gems"),
    ],
    RecordingExecutor::new(),
    config(1),
  );

  let report = scheduler.run().await;

  assert!(matches!(
    report.step("gems").unwrap().error,
    Some(StepError::Cache(CacheError::StorageFull { capacity: 4, .. }))
  ));
  assert!(matches!(
    report.step("app").unwrap().error,
    Some(StepError::DependencyFailed { .. })
  ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_mount_holders_do_not_overlap() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new()
    .delayed("gems", Duration::from_millis(50))
    .delayed("rubocop", Duration::from_millis(50));
  let mount = || InputRef::CacheMount { id: "bundler".into() };
  let mut scheduler = harness.scheduler(
    vec![
      emit("gems", &["vendor/"]).input(mount()),
      emit("rubocop", &["report"]).input(mount()),
      emit("yarn", &["node_modules/"]),
    ],
    executor.clone(),
    config(3),
  );

  let report = scheduler.run().await;

  assert!(report.is_success());
  assert_eq!(executor.max_concurrent_mounted(), 1);
  let gems = executor.calls().into_iter().find(|c| c.step == "gems").unwrap();
  assert_eq!(gems.mounts, vec!["bundler"]);
}

#[tokio::test]
async fn measured_cost_orders_the_next_run() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new().delayed("slow", Duration::from_millis(80));
  let mut scheduler = harness.scheduler(
    vec![emit("slow", &["slow"]), emit("hinted", &["hinted"]).cost(5)],
    executor,
    config(1),
  );

  let first = scheduler.run().await;
  let order: Vec<&str> = first.dispatch_order.iter().map(|id| id.as_str()).collect();
  assert_eq!(order, vec!["hinted", "slow"]);

  let second = scheduler.run().await;
  let order: Vec<&str> = second.dispatch_order.iter().map(|id| id.as_str()).collect();
  assert_eq!(order, vec!["slow", "hinted"]);
  assert_eq!(second.cached_count(), 2);
}

#[tokio::test]
async fn cycle_is_rejected_before_execution() {
  let harness = Harness::new();
  let executor = RecordingExecutor::new();

  let result = Scheduler::from_steps(
    vec![
      emit("a", &["a"]).after("c"),
      emit("b", &["b"]).after("a"),
      emit("c", &["c"]).after("b"),
    ],
    harness.context.path(),
    harness.cache.clone(),
    executor.clone(),
    config(2),
  );

  assert!(matches!(result, Err(ExecuteError::Graph(GraphError::Cycle { .. }))));
  assert!(executor.executed().is_empty());
}

#[tokio::test]
async fn missing_context_file_is_rejected_before_execution() {
  let harness = Harness::new();
  let result = Scheduler::from_steps(
    vec![emit("gems", &["vendor/"]).file("Gemfile.lock")],
    harness.context.path(),
    harness.cache.clone(),
    RecordingExecutor::new(),
    config(1),
  );

  assert!(matches!(result, Err(ExecuteError::Fingerprint(_))));
}
