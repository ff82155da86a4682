use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a step within one build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for StepId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for StepId {
  fn from(value: &str) -> Self {
    StepId(value.to_string())
  }
}

impl From<String> for StepId {
  fn from(value: String) -> Self {
    StepId(value)
  }
}

/// A reference to something a step consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
  /// A file or directory in the build context, relative to its root.
  File { path: String },
  /// The output of another step.
  Step { id: StepId },
  /// The outputs of every step in a stage.
  Stage { name: String },
  /// A persistent cache directory shared across runs. Not part of the fingerprint.
  CacheMount { id: String },
  /// A literal build parameter.
  Param { name: String, value: String },
}

/// Options for an `exec` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOpts {
  pub bin: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

/// Action descriptor handed to the executor. The engine only hashes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
  Exec(ExecOpts),
  Custom {
    name: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
  },
}

impl Action {
  pub fn exec(bin: impl Into<String>, args: &[&str]) -> Self {
    Action::Exec(ExecOpts {
      bin: bin.into(),
      args: args.iter().map(|a| a.to_string()).collect(),
      env: BTreeMap::new(),
    })
  }

  pub fn custom(name: impl Into<String>) -> Self {
    Action::Custom {
      name: name.into(),
      params: BTreeMap::new(),
    }
  }
}

/// A declared build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDecl {
  pub id: StepId,

  /// Stage this step belongs to, if any.
  #[serde(default)]
  pub stage: Option<String>,

  #[serde(default)]
  pub inputs: Vec<InputRef>,

  pub action: Action,

  /// Relative output paths. An entry ending in `/` names a directory prefix.
  #[serde(default)]
  pub outputs: Vec<String>,

  /// Estimated cost in milliseconds, used until a measured duration exists.
  #[serde(default)]
  pub cost: Option<u64>,

  /// Whether input order is significant for this step's fingerprint.
  #[serde(default)]
  pub order_sensitive: bool,

  /// Terminal steps may declare no outputs.
  #[serde(default)]
  pub terminal: bool,
}

impl StepDecl {
  pub fn new(id: impl Into<StepId>, action: Action) -> Self {
    Self {
      id: id.into(),
      stage: None,
      inputs: Vec::new(),
      action,
      outputs: Vec::new(),
      cost: None,
      order_sensitive: false,
      terminal: false,
    }
  }

  pub fn input(mut self, input: InputRef) -> Self {
    self.inputs.push(input);
    self
  }

  pub fn after(self, id: &str) -> Self {
    self.input(InputRef::Step { id: id.into() })
  }

  pub fn file(self, path: &str) -> Self {
    self.input(InputRef::File { path: path.to_string() })
  }

  pub fn output(mut self, path: &str) -> Self {
    self.outputs.push(path.to_string());
    self
  }

  pub fn stage(mut self, name: &str) -> Self {
    self.stage = Some(name.to_string());
    self
  }

  pub fn cost(mut self, cost: u64) -> Self {
    self.cost = Some(cost);
    self
  }

  pub fn terminal(mut self) -> Self {
    self.terminal = true;
    self
  }

  /// Cache mount ids this step uses, sorted and deduplicated.
  pub fn mount_ids(&self) -> Vec<&str> {
    let mut ids: Vec<&str> = self
      .inputs
      .iter()
      .filter_map(|input| match input {
        InputRef::CacheMount { id } => Some(id.as_str()),
        _ => None,
      })
      .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
  }
}

/// Lifecycle of a step during one scheduler run.
///
/// `pending -> ready -> {cached | running}`, `running -> {done | failed}`.
/// A step may also fail straight from `pending` or `ready` when a dependency
/// fails or the run is cancelled. `cached`, `done` and `failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  Ready,
  Running,
  Cached,
  Done,
  Failed,
}

impl StepStatus {
  pub fn is_final(self) -> bool {
    matches!(self, StepStatus::Cached | StepStatus::Done | StepStatus::Failed)
  }

  /// Whether the step's output is available.
  pub fn is_success(self) -> bool {
    matches!(self, StepStatus::Cached | StepStatus::Done)
  }

  pub fn can_transition_to(self, next: StepStatus) -> bool {
    use StepStatus::*;

    matches!(
      (self, next),
      (Pending, Ready)
        | (Pending, Failed)
        | (Ready, Running)
        | (Ready, Cached)
        | (Ready, Failed)
        | (Running, Done)
        | (Running, Failed)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      StepStatus::Pending => "pending",
      StepStatus::Ready => "ready",
      StepStatus::Running => "running",
      StepStatus::Cached => "cached",
      StepStatus::Done => "done",
      StepStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for StepStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
