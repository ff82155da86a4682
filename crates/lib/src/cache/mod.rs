//! Content-addressed artifact cache.
//!
//! [`CacheStore`] maps fingerprints to artifacts on top of an
//! [`ArtifactBackend`]. It owns capacity accounting and per-fingerprint write
//! exclusion; backends only have to publish entries atomically. Backend I/O
//! from async callers runs on tokio's blocking pool.

mod artifact;
mod backend;
mod evict;
mod lock;
mod mounts;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{Span, debug, info, warn};

pub use artifact::{Artifact, ArtifactEntry, EntryMeta, unix_now};
pub use backend::{ArtifactBackend, BackendError, FsBackend, MemoryBackend};
pub use evict::{EvictionPolicy, EvictionReport, select_victims};
pub use lock::{LockHolder, LockMode, StoreLock, StoreLockError};
pub use mounts::{CacheMounts, MountGuard, MountReadGuard};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache is full: artifact needs {needed} bytes, {available} of {capacity} bytes available")]
  StorageFull { needed: u64, available: u64, capacity: u64 },

  #[error(transparent)]
  Backend(#[from] BackendError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("cache task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
  Stored,
  /// An entry for the fingerprint existed; the new artifact was discarded.
  AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub bytes: u64,
  pub capacity: Option<u64>,
}

type WriteLock = Arc<tokio::sync::Mutex<()>>;

pub struct CacheStore {
  backend: Arc<dyn ArtifactBackend>,
  root: Option<PathBuf>,
  capacity: Option<u64>,
  usage: Mutex<u64>,
  write_locks: Mutex<HashMap<Fingerprint, WriteLock>>,
  lock: Option<StoreLock>,
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("root", &self.root)
      .field("capacity", &self.capacity)
      .field("usage", &self.usage())
      .finish_non_exhaustive()
  }
}

impl CacheStore {
  /// Wrap a backend, seeding usage from its existing entries.
  pub fn new(backend: Arc<dyn ArtifactBackend>) -> Result<Self, CacheError> {
    let usage = backend.entries()?.iter().map(|e| e.size).sum();
    Ok(Self {
      backend,
      root: None,
      capacity: None,
      usage: Mutex::new(usage),
      write_locks: Mutex::new(HashMap::new()),
      lock: None,
    })
  }

  /// Open the on-disk cache at `root`, holding the store lock in `mode` for
  /// the lifetime of the returned store.
  pub fn open(root: &Path, mode: LockMode, command: &str) -> Result<Self, CacheError> {
    let lock = StoreLock::acquire(root, mode, command)?;
    let mut store = Self::new(Arc::new(FsBackend::new(root)))?;
    store.root = Some(root.to_path_buf());
    store.lock = Some(lock);
    debug!(root = ?root, usage = store.usage(), "opened cache");
    Ok(store)
  }

  pub fn in_memory() -> Self {
    Self {
      backend: Arc::new(MemoryBackend::new()),
      root: None,
      capacity: None,
      usage: Mutex::new(0),
      write_locks: Mutex::new(HashMap::new()),
      lock: None,
    }
  }

  /// Limit the total bytes of stored artifacts.
  pub fn with_capacity(mut self, capacity: u64) -> Self {
    self.capacity = Some(capacity);
    self
  }

  /// Root directory for on-disk caches.
  pub fn root(&self) -> Option<&Path> {
    self.root.as_deref()
  }

  pub fn capacity(&self) -> Option<u64> {
    self.capacity
  }

  pub fn usage(&self) -> u64 {
    *self.usage.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Mode of the store lock, for stores opened with [`CacheStore::open`].
  pub fn lock_mode(&self) -> Option<LockMode> {
    self.lock.as_ref().map(StoreLock::mode)
  }

  /// Whether entries can be removed without pulling them from under another
  /// process: the store lock is exclusive, or no on-disk store is shared.
  pub fn may_evict(&self) -> bool {
    self.lock_mode().is_none_or(|mode| mode == LockMode::Exclusive)
  }

  /// Look up a complete entry. A hit refreshes its `last_used` time.
  pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Arc<Artifact>>, CacheError> {
    let backend = self.backend.clone();
    let key = fingerprint.clone();
    let loaded = blocking(move || {
      let Some((artifact, _)) = backend.load(&key)? else {
        return Ok(None);
      };
      if let Err(e) = backend.touch(&key, unix_now()) {
        warn!(fingerprint = %key.short(), error = %e, "failed to update cache entry access time");
      }
      Ok(Some(artifact))
    })
    .await?;

    match &loaded {
      Some(artifact) => debug!(fingerprint = %fingerprint.short(), files = artifact.len(), "cache hit"),
      None => debug!(fingerprint = %fingerprint.short(), "cache miss"),
    }
    Ok(loaded.map(Arc::new))
  }

  pub fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    Ok(self.backend.contains(fingerprint)?)
  }

  /// Store `artifact` under `fingerprint`.
  ///
  /// Writers of one fingerprint are serialized; the later one sees the
  /// earlier entry and returns [`PutOutcome::AlreadyPresent`].
  pub async fn put(&self, fingerprint: &Fingerprint, artifact: Arc<Artifact>) -> Result<PutOutcome, CacheError> {
    let lock = self.write_lock(fingerprint);
    let outcome = {
      let _guard = lock.lock().await;
      self.put_locked(fingerprint, artifact).await
    };
    self.release_write_lock(fingerprint, &lock);
    outcome
  }

  async fn put_locked(&self, fingerprint: &Fingerprint, artifact: Arc<Artifact>) -> Result<PutOutcome, CacheError> {
    let backend = self.backend.clone();
    let key = fingerprint.clone();
    if blocking(move || backend.contains(&key)).await? {
      debug!(fingerprint = %fingerprint.short(), "cache entry already present");
      return Ok(PutOutcome::AlreadyPresent);
    }

    let size = artifact.size();
    self.reserve(size)?;

    let now = unix_now();
    let meta = EntryMeta {
      fingerprint: fingerprint.clone(),
      size,
      created_at: now,
      last_used: now,
    };

    let files = artifact.len();
    let backend = self.backend.clone();
    match blocking(move || backend.store(&artifact, &meta)).await {
      Ok(true) => {
        info!(fingerprint = %fingerprint.short(), bytes = size, files, "stored artifact");
        Ok(PutOutcome::Stored)
      }
      Ok(false) => {
        self.release(size);
        Ok(PutOutcome::AlreadyPresent)
      }
      Err(e) => {
        self.release(size);
        Err(e)
      }
    }
  }

  fn reserve(&self, size: u64) -> Result<(), CacheError> {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(capacity) = self.capacity {
      let available = capacity.saturating_sub(*usage);
      if size > available {
        return Err(CacheError::StorageFull {
          needed: size,
          available,
          capacity,
        });
      }
    }
    *usage += size;
    Ok(())
  }

  fn release(&self, size: u64) {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    *usage = usage.saturating_sub(size);
  }

  fn write_lock(&self, fingerprint: &Fingerprint) -> WriteLock {
    let mut locks = self.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(fingerprint.clone()).or_default().clone()
  }

  /// Drop the map entry once no other writer holds a handle to it.
  fn release_write_lock(&self, fingerprint: &Fingerprint, lock: &WriteLock) {
    let mut locks = self.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = locks.get(fingerprint)
      && Arc::ptr_eq(existing, lock)
      && Arc::strong_count(existing) <= 2
    {
      locks.remove(fingerprint);
    }
  }

  /// Number of fingerprints with a write in flight.
  pub fn pending_writes(&self) -> usize {
    self.write_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Entries `policy` would remove, without removing them.
  pub fn eviction_candidates(&self, policy: EvictionPolicy) -> Result<Vec<EntryMeta>, CacheError> {
    let entries = self.backend.entries()?;
    Ok(select_victims(policy, &entries, unix_now()))
  }

  pub fn evict(&self, policy: EvictionPolicy) -> Result<EvictionReport, CacheError> {
    let mut report = EvictionReport::default();

    for victim in self.eviction_candidates(policy)? {
      let freed = self.backend.remove(&victim.fingerprint)?;
      self.release(freed);
      debug!(fingerprint = %victim.fingerprint.short(), bytes = freed, "evicted cache entry");
      report.bytes_freed += freed;
      report.evicted.push(victim.fingerprint);
    }

    let stats = self.stats()?;
    report.remaining_entries = stats.entries;
    report.remaining_bytes = stats.bytes;

    if !report.evicted.is_empty() {
      info!(
        evicted = report.evicted.len(),
        bytes_freed = report.bytes_freed,
        remaining = report.remaining_entries,
        "cache eviction complete"
      );
    }
    Ok(report)
  }

  pub fn stats(&self) -> Result<CacheStats, CacheError> {
    let entries = self.backend.entries()?;
    Ok(CacheStats {
      entries: entries.len(),
      bytes: entries.iter().map(|e| e.size).sum(),
      capacity: self.capacity,
    })
  }
}

/// Run backend work on the blocking pool, inside the caller's span.
async fn blocking<T, F>(work: F) -> Result<T, CacheError>
where
  T: Send + 'static,
  F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
  let span = Span::current();
  Ok(tokio::task::spawn_blocking(move || span.in_scope(work)).await??)
}
