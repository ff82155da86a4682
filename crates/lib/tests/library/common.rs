//! Shared fixtures for library integration tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_lib::cache::{Artifact, CacheStore};
use strata_lib::execute::{ActionError, ActionExecutor, ActionRequest, ExecuteConfig, Scheduler};
use strata_lib::step::{Action, StepDecl};
use tempfile::TempDir;
use tokio::sync::Barrier;

/// One executor invocation as observed by [`RecordingExecutor`].
#[derive(Debug, Clone)]
pub struct Call {
  pub step: String,
  pub upstream: Vec<String>,
  pub mounts: Vec<String>,
}

#[derive(Default)]
struct Inner {
  calls: Mutex<Vec<Call>>,
  failing: HashSet<String>,
  omitting: HashSet<String>,
  delays: HashMap<String, Duration>,
  barrier: Option<Barrier>,
  mounted_now: AtomicUsize,
  mounted_max: AtomicUsize,
}

/// Executor for `emit` steps: writes each action param as a file.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
  inner: Arc<Inner>,
}

impl RecordingExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  fn configure(mut self, f: impl FnOnce(&mut Inner)) -> Self {
    let inner = Arc::get_mut(&mut self.inner).expect("configure before sharing the executor");
    f(inner);
    self
  }

  pub fn failing(self, step: &str) -> Self {
    self.configure(|inner| {
      inner.failing.insert(step.to_string());
    })
  }

  /// Succeed without producing any files.
  pub fn omitting(self, step: &str) -> Self {
    self.configure(|inner| {
      inner.omitting.insert(step.to_string());
    })
  }

  pub fn delayed(self, step: &str, delay: Duration) -> Self {
    self.configure(|inner| {
      inner.delays.insert(step.to_string(), delay);
    })
  }

  /// Every action waits until `n` actions are running at once.
  pub fn rendezvous(self, n: usize) -> Self {
    self.configure(|inner| inner.barrier = Some(Barrier::new(n)))
  }

  pub fn calls(&self) -> Vec<Call> {
    self.inner.calls.lock().unwrap().clone()
  }

  pub fn executed(&self) -> Vec<String> {
    self.calls().into_iter().map(|c| c.step).collect()
  }

  /// Highest number of actions that held a cache mount at the same time.
  pub fn max_concurrent_mounted(&self) -> usize {
    self.inner.mounted_max.load(Ordering::SeqCst)
  }
}

impl ActionExecutor for RecordingExecutor {
  async fn execute(&self, request: ActionRequest) -> Result<Artifact, ActionError> {
    let step = request.step.to_string();
    self.inner.calls.lock().unwrap().push(Call {
      step: step.clone(),
      upstream: request.upstream.iter().map(|(id, _)| id.to_string()).collect(),
      mounts: request.mounts.keys().cloned().collect(),
    });

    if let Some(barrier) = &self.inner.barrier {
      barrier.wait().await;
    }

    let mounted = !request.mounts.is_empty();
    if mounted {
      let now = self.inner.mounted_now.fetch_add(1, Ordering::SeqCst) + 1;
      self.inner.mounted_max.fetch_max(now, Ordering::SeqCst);
    }
    if let Some(delay) = self.inner.delays.get(&step) {
      tokio::time::sleep(*delay).await;
    }
    if mounted {
      self.inner.mounted_now.fetch_sub(1, Ordering::SeqCst);
    }

    if self.inner.failing.contains(&step) {
      return Err(ActionError::Failed(format!("{step} exploded")));
    }

    let Action::Custom { params, .. } = &request.action else {
      return Err(ActionError::Unsupported("only emit steps are supported".into()));
    };

    let mut artifact = Artifact::new();
    if !self.inner.omitting.contains(&step) {
      for (path, contents) in params {
        artifact.insert(path.clone(), contents.as_bytes());
      }
    }
    Ok(artifact)
  }
}

/// A step that produces one file per declared output. Directory outputs
/// (ending in `/`) get an `index` file inside.
pub fn emit(id: &str, outputs: &[&str]) -> StepDecl {
  let mut params = BTreeMap::new();
  for output in outputs {
    let file = if output.ends_with('/') {
      format!("{output}index")
    } else {
      output.to_string()
    };
    params.insert(file, format!("{id}:{output}"));
  }

  outputs.iter().fold(
    StepDecl::new(
      id,
      Action::Custom {
        name: "emit".to_string(),
        params,
      },
    ),
    |step, output| step.output(output),
  )
}

pub fn config(max_parallel: usize) -> ExecuteConfig {
  ExecuteConfig {
    max_parallel,
    ..ExecuteConfig::default()
  }
}

/// A scheduler over an in-memory cache and an empty context directory.
pub struct Harness {
  pub context: TempDir,
  pub cache: Arc<CacheStore>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_cache(CacheStore::in_memory())
  }

  pub fn with_cache(cache: CacheStore) -> Self {
    Self {
      context: TempDir::new().unwrap(),
      cache: Arc::new(cache),
    }
  }

  pub fn scheduler(
    &self,
    steps: Vec<StepDecl>,
    executor: RecordingExecutor,
    config: ExecuteConfig,
  ) -> Scheduler<RecordingExecutor> {
    Scheduler::from_steps(steps, self.context.path(), self.cache.clone(), executor, config).unwrap()
  }

  pub fn write(&self, path: &str, contents: &str) {
    let full = self.context.path().join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, contents).unwrap();
  }
}
