//! Configuration, errors and results of a scheduler run.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::executor::ActionError;
use crate::cache::{Artifact, CacheError, EvictionPolicy, EvictionReport};
use crate::fingerprint::{Fingerprint, FingerprintError};
use crate::graph::GraphError;
use crate::step::{StepId, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteConfig {
  /// Upper bound on concurrently executing steps.
  pub max_parallel: usize,
  /// Stop dispatching after the first failure.
  pub fail_fast: bool,
  pub step_timeout: Option<Duration>,
  /// Applied to the cache once the run finishes.
  pub eviction_policy: EvictionPolicy,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      max_parallel: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      fail_fast: false,
      step_timeout: None,
      eviction_policy: EvictionPolicy::Never,
    }
  }
}

/// Errors raised before any step runs.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),

  #[error("failed to prepare cache mounts: {0}")]
  Mounts(#[source] std::io::Error),
}

/// Why a step failed.
#[derive(Debug, Error)]
pub enum StepError {
  #[error("timed out after {}", humanize(.after))]
  Timeout { after: Duration },

  #[error("action failed: {0}")]
  ActionExecution(#[from] ActionError),

  #[error("dependency '{dependency}' failed")]
  DependencyFailed { dependency: StepId },

  #[error("cancelled before execution")]
  Cancelled,

  #[error("declared output '{path}' was not produced")]
  MissingDeclaredOutput { path: String },

  #[error("cache error: {0}")]
  Cache(#[from] CacheError),

  #[error("cache mount '{id}' unavailable: {source}")]
  Mount {
    id: String,
    #[source]
    source: std::io::Error,
  },

  #[error("worker panicked: {0}")]
  Panicked(String),
}

fn humanize(d: &Duration) -> String {
  if d.subsec_millis() == 0 {
    format!("{}s", d.as_secs())
  } else {
    format!("{}ms", d.as_millis())
  }
}

/// Final state of one step.
#[derive(Debug)]
pub struct StepReport {
  pub id: StepId,
  pub status: StepStatus,
  pub fingerprint: Fingerprint,
  pub error: Option<StepError>,
  /// Wall time of the action, for executed steps.
  pub duration: Option<Duration>,
  pub output: Option<Arc<Artifact>>,
}

impl StepReport {
  pub fn executed(&self) -> bool {
    self.status == StepStatus::Done
  }
}

/// Outcome of a scheduler run. Steps are listed in declaration order.
#[derive(Debug)]
pub struct RunReport {
  pub steps: Vec<StepReport>,
  /// Step ids in the order they were handed to workers.
  pub dispatch_order: Vec<StepId>,
  pub elapsed: Duration,
  pub eviction: Option<EvictionReport>,
}

impl RunReport {
  /// True when every step is `done` or `cached`.
  pub fn is_success(&self) -> bool {
    self.steps.iter().all(|s| s.status.is_success())
  }

  pub fn step(&self, id: &str) -> Option<&StepReport> {
    self.steps.iter().find(|s| s.id.as_str() == id)
  }

  pub fn status(&self, id: &str) -> Option<StepStatus> {
    self.step(id).map(|s| s.status)
  }

  pub fn output(&self, id: &str) -> Option<&Artifact> {
    self.step(id).and_then(|s| s.output.as_deref())
  }

  pub fn executed_count(&self) -> usize {
    self.steps.iter().filter(|s| s.status == StepStatus::Done).count()
  }

  pub fn cached_count(&self) -> usize {
    self.steps.iter().filter(|s| s.status == StepStatus::Cached).count()
  }

  pub fn failed(&self) -> impl Iterator<Item = &StepReport> {
    self.steps.iter().filter(|s| s.status == StepStatus::Failed)
  }

  /// Steps left `pending` or `ready`, e.g. after a fail-fast halt.
  pub fn not_started(&self) -> impl Iterator<Item = &StepReport> {
    self.steps.iter().filter(|s| !s.status.is_final())
  }
}
