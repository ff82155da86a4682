mod build;
mod cache;
mod plan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub use build::{BuildArgs, cmd_build};
pub use cache::{GcArgs, cmd_cache_gc, cmd_cache_stats};
pub use plan::cmd_plan;

/// The explicit context, or the directory holding the build file.
fn resolve_context(file: &Path, context: Option<&Path>) -> Result<PathBuf> {
  let dir = match context {
    Some(dir) => dir.to_path_buf(),
    None => match file.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
      _ => PathBuf::from("."),
    },
  };
  dunce::canonicalize(&dir).with_context(|| format!("Build context not found: {}", dir.display()))
}
