//! Assembling the final artifact from selected stages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::Artifact;
use crate::execute::RunReport;
use crate::graph::StepGraph;
use crate::step::{StepId, StepStatus};

#[derive(Debug, Error)]
pub enum MaterializeError {
  #[error("unknown stage '{0}'")]
  UnknownStage(String),

  #[error("stage '{stage}' cannot be materialized: step '{step}' is {status}")]
  MissingOutput {
    stage: String,
    step: StepId,
    status: StepStatus,
  },

  #[error("failed to write {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Merged output of the selected stages, with the step that supplied each path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalArtifact {
  artifact: Artifact,
  sources: BTreeMap<String, StepId>,
}

impl FinalArtifact {
  pub fn artifact(&self) -> &Artifact {
    &self.artifact
  }

  pub fn source(&self, path: &str) -> Option<&StepId> {
    self.sources.get(path)
  }

  pub fn sources(&self) -> impl Iterator<Item = (&str, &StepId)> {
    self.sources.iter().map(|(p, s)| (p.as_str(), s))
  }

  pub fn len(&self) -> usize {
    self.artifact.len()
  }

  pub fn is_empty(&self) -> bool {
    self.artifact.is_empty()
  }

  fn overlay(&mut self, step: &StepId, output: &Artifact) {
    for (path, entry) in output.entries() {
      self.artifact.insert_entry(path, entry.clone());
      self.sources.insert(path.to_string(), step.clone());
    }
  }

  /// Export every file below `dir`.
  pub fn write_to(&self, dir: &Path) -> Result<(), MaterializeError> {
    self.artifact.write_to(dir).map_err(|source| MaterializeError::Io {
      path: dir.to_path_buf(),
      source,
    })?;
    info!(path = ?dir, files = self.len(), bytes = self.artifact.size(), "materialized artifact");
    Ok(())
  }
}

/// Overlay the outputs of the selected stages.
///
/// Stages apply in declaration order whatever the selection order, steps
/// within a stage in declaration order, and a later file replaces an earlier
/// one at the same path.
pub fn materialize<S: AsRef<str>>(
  graph: &StepGraph,
  report: &RunReport,
  selections: &[S],
) -> Result<FinalArtifact, MaterializeError> {
  let mut positions = Vec::with_capacity(selections.len());
  for name in selections {
    let name = name.as_ref();
    let position = graph
      .stage_position(name)
      .ok_or_else(|| MaterializeError::UnknownStage(name.to_string()))?;
    positions.push(position);
  }
  positions.sort_unstable();
  positions.dedup();

  let mut result = FinalArtifact::default();
  for position in positions {
    let stage = &graph.stages()[position];
    debug!(stage = %stage.name, steps = stage.steps.len(), "applying stage");

    for &index in &stage.steps {
      let id = &graph.step(index).id;
      let step = report.step(id.as_str());
      let output = step.filter(|s| s.status.is_success()).and_then(|s| s.output.as_deref());
      let Some(output) = output else {
        return Err(MaterializeError::MissingOutput {
          stage: stage.name.clone(),
          step: id.clone(),
          status: step.map(|s| s.status).unwrap_or(StepStatus::Pending),
        });
      };
      result.overlay(id, output);
    }
  }

  Ok(result)
}
