//! Filesystem locations used by the cache.
//!
//! The cache root resolves from `STRATA_CACHE_DIR` first, then the platform
//! cache directory (`$XDG_CACHE_HOME/strata` on unix).

use std::path::{Path, PathBuf};

use crate::consts::{APP_NAME, CACHE_DIR_ENV, COST_HISTORY_FILE};

/// Returns the user's home directory, falling back to the current directory.
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the user's home directory, falling back to the current directory.
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(windows)]
fn platform_cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join("AppData").join("Local"))
    .join(APP_NAME)
    .join("Cache")
}

#[cfg(not(windows))]
fn platform_cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Root directory of the artifact cache.
pub fn cache_dir() -> PathBuf {
  if let Ok(path) = std::env::var(CACHE_DIR_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }

  platform_cache_dir()
}

/// Directory holding one subdirectory per cached fingerprint.
pub fn objects_dir(root: &Path) -> PathBuf {
  root.join("objects")
}

/// Directory holding cache mounts.
pub fn mounts_dir(root: &Path) -> PathBuf {
  root.join("mounts")
}

/// Location of the persisted step cost history.
pub fn history_path(root: &Path) -> PathBuf {
  root.join(COST_HISTORY_FILE)
}
