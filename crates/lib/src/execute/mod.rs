//! Step scheduling and execution.
//!
//! A single coordinator loop owns every step's status and the ready queue.
//! Ready steps are handed to tokio tasks, bounded by a semaphore of
//! `max_parallel` permits. Each task consults the cache by fingerprint and
//! either reuses the stored artifact (`cached`) or runs the action, stores the
//! result and reports `done`. Failures are reported back to the coordinator,
//! which fails every transitive dependent without running it while unrelated
//! branches continue.
//!
//! Artifacts are shared behind `Arc`, so handing an output to several
//! dependents never copies its contents.

mod cmd;
mod executor;
mod history;
mod queue;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use cmd::{CmdExecutor, mount_env_var, param_env_var};
pub use executor::{ActionError, ActionExecutor, ActionRequest};
pub use history::CostHistory;
pub use types::*;

use crate::cache::{Artifact, CacheMounts, CacheStore, EvictionPolicy, EvictionReport, MountGuard};
use crate::fingerprint::{Fingerprint, FingerprintEngine};
use crate::graph::StepGraph;
use crate::paths::history_path;
use crate::step::{InputRef, StepDecl, StepId, StepStatus};
use queue::ReadyQueue;

/// How a worker finished successfully.
enum Outcome {
  Cached(Arc<Artifact>),
  Executed { artifact: Arc<Artifact>, elapsed: Duration },
}

/// State shared by all workers of one run.
struct Shared<E> {
  cache: Arc<CacheStore>,
  executor: Arc<E>,
  mounts: Arc<CacheMounts>,
  cancelled: AtomicBool,
  step_timeout: Option<Duration>,
  started: mpsc::UnboundedSender<usize>,
}

/// Runs a validated step graph against a cache.
pub struct Scheduler<E: ActionExecutor> {
  graph: Arc<StepGraph>,
  fingerprints: Vec<Fingerprint>,
  context_dir: PathBuf,
  cache: Arc<CacheStore>,
  executor: Arc<E>,
  mounts: Arc<CacheMounts>,
  history: CostHistory,
  config: ExecuteConfig,
}

impl<E: ActionExecutor> Scheduler<E> {
  /// Fingerprint every step up front; a failure here means nothing runs.
  ///
  /// Cache mounts and cost history live under the cache root for on-disk
  /// caches, and in temporary storage otherwise.
  pub fn new(
    graph: StepGraph,
    context_dir: impl Into<PathBuf>,
    cache: Arc<CacheStore>,
    executor: E,
    config: ExecuteConfig,
  ) -> Result<Self, ExecuteError> {
    let context_dir = context_dir.into();
    let fingerprints = FingerprintEngine::new(&context_dir).fingerprint_graph(&graph)?;

    let (mounts, history) = match cache.root() {
      Some(root) => (CacheMounts::new(root), CostHistory::load(&history_path(root))),
      None => (
        CacheMounts::ephemeral().map_err(ExecuteError::Mounts)?,
        CostHistory::in_memory(),
      ),
    };

    Ok(Self {
      graph: Arc::new(graph),
      fingerprints,
      context_dir,
      cache,
      executor: Arc::new(executor),
      mounts: Arc::new(mounts),
      history,
      config,
    })
  }

  /// Build the graph from declarations, then as [`Scheduler::new`].
  pub fn from_steps(
    steps: Vec<StepDecl>,
    context_dir: impl Into<PathBuf>,
    cache: Arc<CacheStore>,
    executor: E,
    config: ExecuteConfig,
  ) -> Result<Self, ExecuteError> {
    Self::new(StepGraph::build(steps)?, context_dir, cache, executor, config)
  }

  /// Use `mounts` instead of the default set, e.g. to share one set between
  /// schedulers.
  pub fn with_mounts(mut self, mounts: Arc<CacheMounts>) -> Self {
    self.mounts = mounts;
    self
  }

  pub fn with_history(mut self, history: CostHistory) -> Self {
    self.history = history;
    self
  }

  pub fn graph(&self) -> &StepGraph {
    &self.graph
  }

  pub fn fingerprints(&self) -> &[Fingerprint] {
    &self.fingerprints
  }

  pub fn fingerprint(&self, id: &str) -> Option<&Fingerprint> {
    self
      .graph
      .index_of(&StepId::from(id))
      .map(|index| &self.fingerprints[index])
  }

  pub fn history(&self) -> &CostHistory {
    &self.history
  }

  /// Run every step once. Never fails as a whole; per-step failures are in
  /// the report.
  pub async fn run(&mut self) -> RunReport {
    let start = Instant::now();
    let graph = self.graph.clone();
    let max_parallel = self.config.max_parallel.max(1);

    info!(
      steps = graph.len(),
      max_parallel,
      fail_fast = self.config.fail_fast,
      "starting build"
    );

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
      cache: self.cache.clone(),
      executor: self.executor.clone(),
      mounts: self.mounts.clone(),
      cancelled: AtomicBool::new(false),
      step_timeout: self.config.step_timeout,
      started: started_tx,
    });

    let mut run = RunState::new(&graph);
    for index in 0..graph.len() {
      if run.remaining[index] == 0 {
        run.transition(&graph, index, StepStatus::Ready);
        run.queue.push(index, self.history.estimate(graph.step(index)));
      }
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut join_set = JoinSet::new();
    let mut tasks = HashMap::new();
    let mut halted = false;

    loop {
      if !halted {
        while !run.queue.is_empty() {
          let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            break;
          };
          let Some(index) = run.queue.pop() else {
            break;
          };
          if run.status[index] != StepStatus::Ready {
            continue;
          }

          let request = self.request_for(index, &run.outputs);
          let declared = graph.step(index).outputs.clone();
          let mount_ids: Vec<String> = graph.step(index).mount_ids().into_iter().map(str::to_string).collect();
          debug!(step = %graph.step(index).id, fingerprint = %request.fingerprint.short(), "dispatching step");
          run.dispatch_order.push(graph.step(index).id.clone());

          let handle = join_set.spawn(run_step(shared.clone(), index, request, declared, mount_ids, permit));
          tasks.insert(handle.id(), index);
        }
      }

      let joined = tokio::select! {
        Some(index) = started_rx.recv() => {
          run.transition(&graph, index, StepStatus::Running);
          continue;
        }
        joined = join_set.join_next_with_id() => joined,
      };

      let Some(joined) = joined else {
        break;
      };

      // Workers announce a start before finishing, so apply it first.
      while let Ok(index) = started_rx.try_recv() {
        run.transition(&graph, index, StepStatus::Running);
      }

      let (index, result) = match joined {
        Ok((id, (index, result))) => {
          tasks.remove(&id);
          (index, result)
        }
        Err(e) => {
          let Some(index) = tasks.remove(&e.id()) else {
            error!(error = %e, "lost track of a worker task");
            continue;
          };
          error!(step = %graph.step(index).id, error = %e, "step task panicked");
          (index, Err(StepError::Panicked(e.to_string())))
        }
      };

      let id = &graph.step(index).id;
      match result {
        Ok(Outcome::Cached(artifact)) => {
          info!(step = %id, fingerprint = %self.fingerprints[index].short(), "step cached");
          run.transition(&graph, index, StepStatus::Cached);
          run.outputs[index] = Some(artifact);
          self.release_dependents(&mut run, index);
        }
        Ok(Outcome::Executed { artifact, elapsed }) => {
          info!(
            step = %id,
            fingerprint = %self.fingerprints[index].short(),
            elapsed_ms = elapsed.as_millis() as u64,
            "step done"
          );
          run.transition(&graph, index, StepStatus::Done);
          run.outputs[index] = Some(artifact);
          run.durations[index] = Some(elapsed);
          self.history.record(id, elapsed);
          self.release_dependents(&mut run, index);
        }
        Err(err) => {
          let cancelled = matches!(err, StepError::Cancelled);
          if cancelled {
            warn!(step = %id, "step cancelled");
          } else {
            error!(step = %id, error = %err, "step failed");
          }
          run.transition(&graph, index, StepStatus::Failed);
          run.errors[index] = Some(err);
          run.fail_dependents(&graph, index);

          if self.config.fail_fast && !cancelled && !halted {
            warn!(step = %id, "fail-fast: halting dispatch");
            halted = true;
            shared.cancelled.store(true, Ordering::SeqCst);
          }
        }
      }
    }

    if let Err(e) = self.history.save() {
      warn!(error = %e, "failed to save cost history");
    }

    let eviction = self.evict_after_run().await;
    let report = run.into_report(&graph, &self.fingerprints, start.elapsed(), eviction);
    info!(
      executed = report.executed_count(),
      cached = report.cached_count(),
      failed = report.failed().count(),
      not_started = report.not_started().count(),
      elapsed_ms = report.elapsed.as_millis() as u64,
      "build complete"
    );
    report
  }

  /// Apply the configured eviction policy, unless other builds may be
  /// reading the same cache.
  async fn evict_after_run(&self) -> Option<EvictionReport> {
    let policy = self.config.eviction_policy;
    if policy == EvictionPolicy::Never {
      return None;
    }
    if !self.cache.may_evict() {
      warn!(?policy, "skipping cache eviction: store lock is not held exclusively");
      return None;
    }

    let cache = self.cache.clone();
    match tokio::task::spawn_blocking(move || cache.evict(policy)).await {
      Ok(Ok(report)) => Some(report),
      Ok(Err(e)) => {
        warn!(error = %e, "cache eviction failed");
        None
      }
      Err(e) => {
        warn!(error = %e, "cache eviction task failed");
        None
      }
    }
  }

  fn release_dependents(&self, run: &mut RunState, index: usize) {
    for dependent in self.graph.dependents(index) {
      run.remaining[dependent] = run.remaining[dependent].saturating_sub(1);
      if run.remaining[dependent] == 0 && run.status[dependent] == StepStatus::Pending {
        run.transition(&self.graph, dependent, StepStatus::Ready);
        run
          .queue
          .push(dependent, self.history.estimate(self.graph.step(dependent)));
      }
    }
  }

  /// Assemble what the executor sees. Upstream outputs follow the order the
  /// step declares its inputs.
  fn request_for(&self, index: usize, outputs: &[Option<Arc<Artifact>>]) -> ActionRequest {
    let step = self.graph.step(index);
    let mut upstream = Vec::new();
    let mut context_files = Vec::new();
    let mut params = BTreeMap::new();

    let mut push_upstream = |producer: usize| {
      if let Some(artifact) = &outputs[producer] {
        upstream.push((self.graph.step(producer).id.clone(), artifact.clone()));
      }
    };

    for input in &step.inputs {
      match input {
        InputRef::File { path } => context_files.push(path.clone()),
        InputRef::Step { id } => {
          if let Some(producer) = self.graph.index_of(id) {
            push_upstream(producer);
          }
        }
        InputRef::Stage { name } => {
          if let Some(stage) = self.graph.stage(name) {
            for &member in &stage.steps {
              push_upstream(member);
            }
          }
        }
        InputRef::Param { name, value } => {
          params.insert(name.clone(), value.clone());
        }
        InputRef::CacheMount { .. } => {}
      }
    }

    ActionRequest {
      step: step.id.clone(),
      action: step.action.clone(),
      fingerprint: self.fingerprints[index].clone(),
      context_dir: self.context_dir.clone(),
      context_files,
      upstream,
      mounts: BTreeMap::new(),
      params,
    }
  }
}

/// Coordinator-owned per-step state for one run.
struct RunState {
  status: Vec<StepStatus>,
  remaining: Vec<usize>,
  outputs: Vec<Option<Arc<Artifact>>>,
  errors: Vec<Option<StepError>>,
  durations: Vec<Option<Duration>>,
  queue: ReadyQueue,
  dispatch_order: Vec<StepId>,
}

impl RunState {
  fn new(graph: &StepGraph) -> Self {
    let n = graph.len();
    Self {
      status: vec![StepStatus::Pending; n],
      remaining: (0..n).map(|i| graph.dependencies(i).len()).collect(),
      outputs: vec![None; n],
      errors: (0..n).map(|_| None).collect(),
      durations: vec![None; n],
      queue: ReadyQueue::new(),
      dispatch_order: Vec::new(),
    }
  }

  fn transition(&mut self, graph: &StepGraph, index: usize, next: StepStatus) {
    let current = self.status[index];
    if current == next {
      return;
    }
    if !current.can_transition_to(next) {
      warn!(step = %graph.step(index).id, from = %current, to = %next, "ignoring invalid status transition");
      return;
    }
    self.status[index] = next;
  }

  /// Fail every step downstream of `index` that has not reached a final state.
  fn fail_dependents(&mut self, graph: &StepGraph, index: usize) {
    let failed = &graph.step(index).id;
    for dependent in graph.transitive_dependents(index) {
      if self.status[dependent].is_final() {
        continue;
      }
      warn!(step = %graph.step(dependent).id, failed_dep = %failed, "skipping step due to failed dependency");
      self.transition(graph, dependent, StepStatus::Failed);
      self.errors[dependent] = Some(StepError::DependencyFailed {
        dependency: failed.clone(),
      });
    }
  }

  fn into_report(
    self,
    graph: &StepGraph,
    fingerprints: &[Fingerprint],
    elapsed: Duration,
    eviction: Option<EvictionReport>,
  ) -> RunReport {
    let steps = self
      .status
      .into_iter()
      .zip(self.errors)
      .zip(self.outputs)
      .zip(self.durations)
      .enumerate()
      .map(|(index, (((status, error), output), duration))| StepReport {
        id: graph.step(index).id.clone(),
        status,
        fingerprint: fingerprints[index].clone(),
        error,
        duration,
        output,
      })
      .collect();

    RunReport {
      steps,
      dispatch_order: self.dispatch_order,
      elapsed,
      eviction,
    }
  }
}

/// Worker body for one step. Holds its pool permit until it returns.
async fn run_step<E: ActionExecutor>(
  shared: Arc<Shared<E>>,
  index: usize,
  request: ActionRequest,
  declared: Vec<String>,
  mount_ids: Vec<String>,
  _permit: OwnedSemaphorePermit,
) -> (usize, Result<Outcome, StepError>) {
  let result = execute_step(&shared, index, request, &declared, mount_ids).await;
  (index, result)
}

async fn execute_step<E: ActionExecutor>(
  shared: &Shared<E>,
  index: usize,
  mut request: ActionRequest,
  declared: &[String],
  mount_ids: Vec<String>,
) -> Result<Outcome, StepError> {
  if shared.cancelled.load(Ordering::SeqCst) {
    return Err(StepError::Cancelled);
  }

  if let Some(artifact) = shared.cache.get(&request.fingerprint).await? {
    return Ok(Outcome::Cached(artifact));
  }

  // Sorted ids keep lock order consistent across steps.
  let mut guards: Vec<MountGuard> = Vec::with_capacity(mount_ids.len());
  for id in mount_ids {
    let guard = shared
      .mounts
      .acquire(&id)
      .await
      .map_err(|source| StepError::Mount { id: id.clone(), source })?;
    request.mounts.insert(id, guard.path().to_path_buf());
    guards.push(guard);
  }

  if shared.cancelled.load(Ordering::SeqCst) {
    return Err(StepError::Cancelled);
  }

  // The coordinator only stops listening once every worker has finished.
  let _ = shared.started.send(index);

  let step = request.step.clone();
  let fingerprint = request.fingerprint.clone();
  let start = Instant::now();
  let produced = match shared.step_timeout {
    Some(limit) => tokio::time::timeout(limit, shared.executor.execute(request))
      .await
      .map_err(|_| StepError::Timeout { after: limit })??,
    None => shared.executor.execute(request).await?,
  };
  let elapsed = start.elapsed();
  drop(guards);

  let artifact = produced
    .select(declared)
    .map_err(|path| StepError::MissingDeclaredOutput { path })?;
  debug!(step = %step, files = artifact.len(), bytes = artifact.size(), "action finished");

  let artifact = Arc::new(artifact);
  shared.cache.put(&fingerprint, artifact.clone()).await?;
  Ok(Outcome::Executed { artifact, elapsed })
}
