//! Cross-process lock on a cache root.
//!
//! Builds hold a shared lock so several can run side by side; `cache gc`
//! takes it exclusively so nothing is evicted under a running build.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifact::unix_now;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
  pub version: u32,
  pub pid: u32,
  pub since_unix: u64,
  pub command: String,
  pub cache_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("cache at {root} is in use by `{command}` (PID {pid}, since unix time {since_unix}); remove {lock_path} if that process is gone")]
  Held {
    root: PathBuf,
    command: String,
    pid: u32,
    since_unix: u64,
    lock_path: PathBuf,
  },

  #[error("cache at {root} is in use by another process; remove {lock_path} if none is running")]
  HeldUnknown { root: PathBuf, lock_path: PathBuf },

  #[error("failed to prepare cache root {path}: {source}")]
  Prepare {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to record lock holder: {0}")]
  Record(#[source] io::Error),

  #[error("failed to lock cache: {0}")]
  Lock(#[source] io::Error),
}

/// Held for as long as the value lives; released on drop.
#[derive(Debug)]
pub struct StoreLock {
  _file: File,
  mode: LockMode,
}

impl StoreLock {
  /// Try to lock `root` without blocking.
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let lock_path = root.join(LOCK_FILENAME);

    std::fs::create_dir_all(root).map_err(|source| StoreLockError::Prepare {
      path: root.to_path_buf(),
      source,
    })?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| StoreLockError::Prepare {
        path: lock_path.clone(),
        source,
      })?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(held_error(root, &lock_path));
      }
      return Err(StoreLockError::Lock(err));
    }

    // Shared holders would clobber each other's record.
    if mode == LockMode::Exclusive {
      record_holder(&file, command, root)?;
    }

    Ok(StoreLock { _file: file, mode })
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }
}

fn record_holder(file: &File, command: &str, root: &Path) -> Result<(), StoreLockError> {
  let holder = LockHolder {
    version: 1,
    pid: std::process::id(),
    since_unix: unix_now(),
    command: command.to_string(),
    cache_root: root.to_path_buf(),
  };

  file.set_len(0).map_err(StoreLockError::Record)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &holder).map_err(|e| StoreLockError::Record(io::Error::other(e)))?;
  writer.flush().map_err(StoreLockError::Record)?;
  Ok(())
}

fn held_error(root: &Path, lock_path: &Path) -> StoreLockError {
  let holder = std::fs::read_to_string(lock_path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());

  match holder {
    Some(holder) => StoreLockError::Held {
      root: root.to_path_buf(),
      command: holder.command,
      pid: holder.pid,
      since_unix: holder.since_unix,
      lock_path: lock_path.to_path_buf(),
    },
    None => StoreLockError::HeldUnknown {
      root: root.to_path_buf(),
      lock_path: lock_path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
  use windows_sys::Win32::System::IO::OVERLAPPED;

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: a zeroed OVERLAPPED is valid and the handle is owned by `file`.
  let result = unsafe {
    let mut overlapped: OVERLAPPED = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
