//! Persistent cache mounts shared between runs.
//!
//! A mount is a directory keyed by a caller-chosen id (for example a package
//! manager download cache). Steps that declare a mount hold it exclusively
//! while their action runs; readers share it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::TempDir;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::paths::mounts_dir;

#[derive(Debug)]
pub struct CacheMounts {
  root: PathBuf,
  locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
  _ephemeral: Option<TempDir>,
}

/// Exclusive access to a mount directory.
#[derive(Debug)]
pub struct MountGuard {
  path: PathBuf,
  _guard: OwnedRwLockWriteGuard<()>,
}

impl MountGuard {
  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// Shared access to a mount directory.
#[derive(Debug)]
pub struct MountReadGuard {
  path: PathBuf,
  _guard: OwnedRwLockReadGuard<()>,
}

impl MountReadGuard {
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl CacheMounts {
  /// Mounts under `<cache_root>/mounts/`.
  pub fn new(cache_root: &Path) -> Self {
    Self {
      root: mounts_dir(cache_root),
      locks: Mutex::new(HashMap::new()),
      _ephemeral: None,
    }
  }

  /// Mounts in a temporary directory removed on drop.
  pub fn ephemeral() -> io::Result<Self> {
    let temp = tempfile::Builder::new().prefix("strata-mounts-").tempdir()?;
    Ok(Self {
      root: temp.path().to_path_buf(),
      locks: Mutex::new(HashMap::new()),
      _ephemeral: Some(temp),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Mount ids become directory names, so only a safe alphabet is accepted.
  pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
      && !id.starts_with('.')
      && id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
  }

  fn lock_for(&self, id: &str) -> Arc<RwLock<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(id.to_string()).or_default().clone()
  }

  fn prepare(&self, id: &str) -> io::Result<PathBuf> {
    if !Self::is_valid_id(id) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid cache mount id '{id}'"),
      ));
    }
    let path = self.root.join(id);
    std::fs::create_dir_all(&path)?;
    Ok(path)
  }

  /// Wait for exclusive access to mount `id`, creating it if needed.
  pub async fn acquire(&self, id: &str) -> io::Result<MountGuard> {
    let path = self.prepare(id)?;
    let guard = self.lock_for(id).write_owned().await;
    debug!(mount = id, "acquired cache mount");
    Ok(MountGuard { path, _guard: guard })
  }

  /// Wait for shared access to mount `id`, creating it if needed.
  pub async fn read(&self, id: &str) -> io::Result<MountReadGuard> {
    let path = self.prepare(id)?;
    let guard = self.lock_for(id).read_owned().await;
    Ok(MountReadGuard { path, _guard: guard })
  }
}
