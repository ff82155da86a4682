//! Content-derived cache keys for steps.
//!
//! A fingerprint is a SHA-256 over a canonical encoding of everything that can
//! change a step's output: its action descriptor, its declared outputs and its
//! resolved inputs. Upstream steps contribute their own fingerprints, so a
//! change anywhere propagates to every transitive dependent and nowhere else.
//!
//! Input encoding:
//!
//! | input         | encoded as                                   |
//! |---------------|----------------------------------------------|
//! | `File`        | path and content hash (file or directory)    |
//! | `Step`        | upstream fingerprint                         |
//! | `Stage`       | fingerprints of every stage step, in order   |
//! | `CacheMount`  | mount id only                                |
//! | `Param`       | name and literal value                       |
//!
//! Unless a step is order sensitive, encoded inputs are sorted before hashing
//! so that reordering a declaration does not cause a cache miss.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::consts::SHORT_FINGERPRINT_LEN;
use crate::graph::StepGraph;
use crate::step::{InputRef, StepDecl, StepId};
use crate::util::hash::hash_path;

const DOMAIN_TAG: &[u8] = b"strata-fingerprint-v1";

/// Deterministic cache key of a step (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Abbreviated form for display.
  pub fn short(&self) -> &str {
    let len = self.0.len().min(SHORT_FINGERPRINT_LEN);
    &self.0[..len]
  }

  /// Whether this looks like a fingerprint (used to validate on-disk names).
  pub fn is_well_formed(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
  #[error("step '{step}' has unresolved input {reference}: {reason}")]
  UnresolvedInput {
    step: StepId,
    reference: String,
    reason: String,
  },
}

/// Computes fingerprints relative to a build context directory.
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
  context_dir: PathBuf,
}

impl FingerprintEngine {
  pub fn new(context_dir: impl Into<PathBuf>) -> Self {
    Self {
      context_dir: context_dir.into(),
    }
  }

  pub fn context_dir(&self) -> &Path {
    &self.context_dir
  }

  /// Fingerprint every step of a graph, indexed like the graph.
  pub fn fingerprint_graph(&self, graph: &StepGraph) -> Result<Vec<Fingerprint>, FingerprintError> {
    let mut known: Vec<Option<Fingerprint>> = vec![None; graph.len()];

    for index in graph.topological_order() {
      let fingerprint = self.fingerprint(graph, index, &known)?;
      debug!(step = %graph.step(index).id, fingerprint = %fingerprint.short(), "fingerprinted step");
      known[index] = Some(fingerprint);
    }

    Ok(known.into_iter().flatten().collect())
  }

  /// Fingerprint one step given the fingerprints of its dependencies.
  ///
  /// `known` is indexed like the graph; every producer of `index` must
  /// already be filled in.
  pub fn fingerprint(
    &self,
    graph: &StepGraph,
    index: usize,
    known: &[Option<Fingerprint>],
  ) -> Result<Fingerprint, FingerprintError> {
    let step = graph.step(index);
    let mut encoded = Vec::with_capacity(step.inputs.len());

    for input in &step.inputs {
      encoded.push(self.encode_input(graph, step, input, known)?);
    }

    if !step.order_sensitive {
      encoded.sort();
    }

    let mut outputs: Vec<&str> = step.outputs.iter().map(String::as_str).collect();
    outputs.sort_unstable();
    outputs.dedup();

    let action = serde_json::to_string(&step.action).map_err(|e| FingerprintError::UnresolvedInput {
      step: step.id.clone(),
      reference: "action".to_string(),
      reason: e.to_string(),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    update_field(&mut hasher, action.as_bytes());
    update_field(&mut hasher, &[u8::from(step.order_sensitive)]);
    for output in outputs {
      update_field(&mut hasher, output.as_bytes());
    }
    for line in &encoded {
      update_field(&mut hasher, line.as_bytes());
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
  }

  fn encode_input(
    &self,
    graph: &StepGraph,
    step: &StepDecl,
    input: &InputRef,
    known: &[Option<Fingerprint>],
  ) -> Result<String, FingerprintError> {
    let unresolved = |reference: String, reason: String| FingerprintError::UnresolvedInput {
      step: step.id.clone(),
      reference,
      reason,
    };

    match input {
      InputRef::File { path } => {
        let full = self
          .resolve_context_path(path)
          .ok_or_else(|| unresolved(format!("file '{path}'"), "path escapes the build context".to_string()))?;
        let (hash, is_dir) = hash_path(&full).map_err(|e| unresolved(format!("file '{path}'"), e.to_string()))?;
        let kind = if is_dir { "dir" } else { "file" };
        Ok(format!("{kind}:{path}:{hash}"))
      }

      InputRef::Step { id } => {
        let fingerprint = graph
          .index_of(id)
          .and_then(|i| known.get(i).cloned().flatten())
          .ok_or_else(|| unresolved(format!("step '{id}'"), "producer has no fingerprint".to_string()))?;
        Ok(format!("step:{fingerprint}"))
      }

      InputRef::Stage { name } => {
        let stage = graph
          .stage(name)
          .filter(|s| !s.steps.is_empty())
          .ok_or_else(|| unresolved(format!("stage '{name}'"), "stage has no steps".to_string()))?;

        let mut parts = Vec::with_capacity(stage.steps.len());
        for &member in &stage.steps {
          let fingerprint = known.get(member).cloned().flatten().ok_or_else(|| {
            unresolved(
              format!("stage '{name}'"),
              format!("step '{}' has no fingerprint", graph.step(member).id),
            )
          })?;
          parts.push(fingerprint.0);
        }
        Ok(format!("stage:{}", parts.join(",")))
      }

      InputRef::CacheMount { id } => Ok(format!("mount:{id}")),

      // The name length keeps `a=b` + `c` apart from `a` + `b=c`.
      InputRef::Param { name, value } => Ok(format!("param:{}:{name}={value}", name.len())),
    }
  }

  /// Join a declared relative path onto the context, refusing anything that
  /// could leave it.
  fn resolve_context_path(&self, path: &str) -> Option<PathBuf> {
    let relative = Path::new(path);
    let escapes = relative
      .components()
      .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.is_empty() {
      return None;
    }
    Some(self.context_dir.join(relative))
  }
}

/// Length-prefixed write so adjacent fields cannot run into each other.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
  hasher.update((bytes.len() as u64).to_le_bytes());
  hasher.update(bytes);
}
