//! Measured step durations, used to order the ready queue on later runs.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::step::{StepDecl, StepId};

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
  version: u32,
  /// Step id to last measured duration in milliseconds.
  steps: BTreeMap<StepId, u64>,
}

#[derive(Debug, Default)]
pub struct CostHistory {
  path: Option<PathBuf>,
  costs: BTreeMap<StepId, u64>,
}

impl CostHistory {
  pub fn in_memory() -> Self {
    Self::default()
  }

  /// Load history from `path`. A missing or unreadable file starts empty.
  pub fn load(path: &Path) -> Self {
    let costs = match std::fs::read_to_string(path) {
      Ok(content) => match serde_json::from_str::<HistoryFile>(&content) {
        Ok(file) => file.steps,
        Err(e) => {
          warn!(path = ?path, error = %e, "ignoring unreadable cost history");
          BTreeMap::new()
        }
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => {
        warn!(path = ?path, error = %e, "ignoring unreadable cost history");
        BTreeMap::new()
      }
    };

    debug!(path = ?path, steps = costs.len(), "loaded cost history");
    Self {
      path: Some(path.to_path_buf()),
      costs,
    }
  }

  /// Recorded duration, else the declared hint, else 0.
  pub fn estimate(&self, step: &StepDecl) -> u64 {
    self.costs.get(&step.id).copied().or(step.cost).unwrap_or(0)
  }

  pub fn record(&mut self, id: &StepId, elapsed: Duration) {
    let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    self.costs.insert(id.clone(), millis);
  }

  /// Write back to the file this history was loaded from, if any.
  pub fn save(&self) -> io::Result<()> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let file = HistoryFile {
      version: 1,
      steps: self.costs.clone(),
    };
    let content = serde_json::to_string_pretty(&file).map_err(io::Error::other)?;
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, content)?;
    std::fs::rename(&staging, path)
  }
}
