//! The boundary between the scheduler and whatever runs an action.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::Artifact;
use crate::fingerprint::Fingerprint;
use crate::step::{Action, StepId};

/// Everything an executor gets to produce one step's artifact.
#[derive(Debug, Clone)]
pub struct ActionRequest {
  pub step: StepId,
  pub action: Action,
  pub fingerprint: Fingerprint,
  /// Directory `context_files` are relative to.
  pub context_dir: PathBuf,
  /// Declared file inputs, relative to `context_dir`.
  pub context_files: Vec<String>,
  /// Outputs of upstream steps, in dependency declaration order.
  pub upstream: Vec<(StepId, Arc<Artifact>)>,
  /// Mount id to directory, held exclusively for the duration of the call.
  pub mounts: BTreeMap<String, PathBuf>,
  pub params: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ActionError {
  #[error("command failed with exit code {code:?}: {cmd}{}", stderr_suffix(.stderr))]
  CmdFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("unsupported action: {0}")]
  Unsupported(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("{0}")]
  Failed(String),
}

fn stderr_suffix(stderr: &str) -> String {
  let trimmed = stderr.trim();
  if trimmed.is_empty() {
    String::new()
  } else {
    format!("\n{trimmed}")
  }
}

/// Runs actions. Results are treated as opaque file sets.
pub trait ActionExecutor: Send + Sync + 'static {
  fn execute(&self, request: ActionRequest) -> impl Future<Output = Result<Artifact, ActionError>> + Send;
}
