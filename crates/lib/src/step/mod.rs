//! Step declarations and run-time status.
//!
//! A step is the unit of build work: a set of input references, an opaque
//! action descriptor and the relative paths it declares as outputs. Steps are
//! supplied by an external build-file front end, usually as a [`BuildFile`].

mod types;

pub use types::*;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized list of step declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
  pub steps: Vec<StepDecl>,
}

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

impl BuildFile {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  /// Read declarations from a JSON file.
  pub fn load(path: &Path) -> Result<Self, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
      path: path.display().to_string(),
      source,
    })?;

    Self::from_json(&content).map_err(|source| LoadError::Parse {
      path: path.display().to_string(),
      source,
    })
  }
}
