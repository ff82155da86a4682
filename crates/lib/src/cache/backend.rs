//! Storage backends for cache entries.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::artifact::{Artifact, EntryMeta};
use crate::consts::{COMPLETE_MARKER, MARKER_VERSION};
use crate::fingerprint::Fingerprint;
use crate::paths::objects_dir;
use crate::util::hash::ContentHash;

#[derive(Debug, Error)]
pub enum BackendError {
  #[error("cache I/O failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid entry marker at {path}: {message}")]
  Marker { path: PathBuf, message: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackendError + '_ {
  move |source| BackendError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Where cache entries live.
///
/// Backends are plain storage: capacity accounting and write exclusion are
/// handled by [`super::CacheStore`]. `store` must make an entry visible
/// atomically, so a concurrent `load` sees either nothing or the whole entry.
pub trait ArtifactBackend: Send + Sync {
  /// A complete, verified entry, or `None`.
  fn load(&self, fingerprint: &Fingerprint) -> Result<Option<(Artifact, EntryMeta)>, BackendError>;

  fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError>;

  /// Returns `false` if an entry already existed and was left untouched.
  fn store(&self, artifact: &Artifact, meta: &EntryMeta) -> Result<bool, BackendError>;

  fn touch(&self, fingerprint: &Fingerprint, last_used: u64) -> Result<(), BackendError>;

  /// Bytes freed.
  fn remove(&self, fingerprint: &Fingerprint) -> Result<u64, BackendError>;

  fn entries(&self) -> Result<Vec<EntryMeta>, BackendError>;
}

/// Keeps entries in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
  entries: Mutex<HashMap<Fingerprint, (Artifact, EntryMeta)>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, (Artifact, EntryMeta)>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl ArtifactBackend for MemoryBackend {
  fn load(&self, fingerprint: &Fingerprint) -> Result<Option<(Artifact, EntryMeta)>, BackendError> {
    Ok(self.lock().get(fingerprint).cloned())
  }

  fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
    Ok(self.lock().contains_key(fingerprint))
  }

  fn store(&self, artifact: &Artifact, meta: &EntryMeta) -> Result<bool, BackendError> {
    let mut entries = self.lock();
    if entries.contains_key(&meta.fingerprint) {
      return Ok(false);
    }
    entries.insert(meta.fingerprint.clone(), (artifact.clone(), meta.clone()));
    Ok(true)
  }

  fn touch(&self, fingerprint: &Fingerprint, last_used: u64) -> Result<(), BackendError> {
    if let Some((_, meta)) = self.lock().get_mut(fingerprint) {
      meta.last_used = meta.last_used.max(last_used);
    }
    Ok(())
  }

  fn remove(&self, fingerprint: &Fingerprint) -> Result<u64, BackendError> {
    Ok(self.lock().remove(fingerprint).map(|(_, meta)| meta.size).unwrap_or(0))
  }

  fn entries(&self) -> Result<Vec<EntryMeta>, BackendError> {
    let mut entries: Vec<EntryMeta> = self.lock().values().map(|(_, meta)| meta.clone()).collect();
    entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(entries)
  }
}

/// Written last into an entry directory; its presence marks the entry complete.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMarker {
  version: u32,
  content_hash: ContentHash,
  #[serde(flatten)]
  meta: EntryMeta,
}

/// Keeps entries as directories under `<root>/objects/<fingerprint>/`.
#[derive(Debug, Clone)]
pub struct FsBackend {
  root: PathBuf,
}

impl FsBackend {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
    objects_dir(&self.root).join(fingerprint.as_str())
  }

  fn read_marker(dir: &Path) -> Result<Option<EntryMarker>, BackendError> {
    let path = dir.join(COMPLETE_MARKER);
    let content = match std::fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(io_err(&path)(e)),
    };
    let marker: EntryMarker = serde_json::from_str(&content).map_err(|e| BackendError::Marker {
      path: path.clone(),
      message: e.to_string(),
    })?;
    if marker.version != MARKER_VERSION {
      return Err(BackendError::Marker {
        path,
        message: format!("unsupported marker version {}", marker.version),
      });
    }
    Ok(Some(marker))
  }

  fn write_marker(dir: &Path, marker: &EntryMarker) -> Result<(), BackendError> {
    let content = serde_json::to_string(marker).map_err(|e| BackendError::Marker {
      path: dir.join(COMPLETE_MARKER),
      message: e.to_string(),
    })?;
    // A uniquely named sibling, renamed over the marker. Its name starts with
    // the marker's, so `load` never mistakes it for artifact content.
    let mut staging = tempfile::Builder::new()
      .prefix(&format!("{COMPLETE_MARKER}."))
      .tempfile_in(dir)
      .map_err(io_err(dir))?;
    writeln!(staging, "{content}").map_err(io_err(staging.path()))?;
    let target = dir.join(COMPLETE_MARKER);
    staging.persist(&target).map_err(|e| io_err(&target)(e.error))?;
    Ok(())
  }

  /// Drop an entry that cannot be trusted.
  fn discard(&self, dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir)
      && e.kind() != io::ErrorKind::NotFound
    {
      warn!(path = ?dir, error = %e, "failed to remove invalid cache entry");
    }
  }
}

impl ArtifactBackend for FsBackend {
  fn load(&self, fingerprint: &Fingerprint) -> Result<Option<(Artifact, EntryMeta)>, BackendError> {
    let dir = self.entry_dir(fingerprint);
    if !dir.exists() {
      return Ok(None);
    }

    let marker = match Self::read_marker(&dir) {
      Ok(Some(marker)) => marker,
      Ok(None) => {
        warn!(fingerprint = %fingerprint, "cache entry has no completion marker, removing");
        self.discard(&dir);
        return Ok(None);
      }
      Err(e) => {
        warn!(fingerprint = %fingerprint, error = %e, "cache entry marker is unreadable, removing");
        self.discard(&dir);
        return Ok(None);
      }
    };

    let artifact = Artifact::from_dir(&dir, &[COMPLETE_MARKER]).map_err(io_err(&dir))?;
    if artifact.content_hash() != marker.content_hash {
      warn!(
        fingerprint = %fingerprint,
        expected = %marker.content_hash,
        actual = %artifact.content_hash(),
        "cache entry content does not match its marker, removing"
      );
      self.discard(&dir);
      return Ok(None);
    }

    Ok(Some((artifact, marker.meta)))
  }

  fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
    Ok(self.entry_dir(fingerprint).join(COMPLETE_MARKER).exists())
  }

  fn store(&self, artifact: &Artifact, meta: &EntryMeta) -> Result<bool, BackendError> {
    let objects = objects_dir(&self.root);
    std::fs::create_dir_all(&objects).map_err(io_err(&objects))?;

    let target = self.entry_dir(&meta.fingerprint);
    if target.join(COMPLETE_MARKER).exists() {
      return Ok(false);
    }
    if target.exists() {
      debug!(fingerprint = %meta.fingerprint, "replacing incomplete cache entry");
      self.discard(&target);
    }

    // Staged under objects/ so the final rename stays on one filesystem.
    let staging = tempfile::Builder::new()
      .prefix(".staging-")
      .tempdir_in(&objects)
      .map_err(io_err(&objects))?;

    artifact.write_to(staging.path()).map_err(io_err(staging.path()))?;
    let marker = EntryMarker {
      version: MARKER_VERSION,
      content_hash: artifact.content_hash(),
      meta: meta.clone(),
    };
    Self::write_marker(staging.path(), &marker)?;

    let staged = staging.keep();
    match std::fs::rename(&staged, &target) {
      Ok(()) => Ok(true),
      Err(_) if target.join(COMPLETE_MARKER).exists() => {
        // Another process published the same entry first.
        self.discard(&staged);
        Ok(false)
      }
      Err(e) => {
        self.discard(&staged);
        Err(io_err(&target)(e))
      }
    }
  }

  fn touch(&self, fingerprint: &Fingerprint, last_used: u64) -> Result<(), BackendError> {
    let dir = self.entry_dir(fingerprint);
    let Some(mut marker) = Self::read_marker(&dir)? else {
      return Ok(());
    };
    if marker.meta.last_used >= last_used {
      return Ok(());
    }
    marker.meta.last_used = last_used;
    Self::write_marker(&dir, &marker)
  }

  fn remove(&self, fingerprint: &Fingerprint) -> Result<u64, BackendError> {
    let dir = self.entry_dir(fingerprint);
    let size = match Self::read_marker(&dir) {
      Ok(Some(marker)) => marker.meta.size,
      _ => 0,
    };
    match std::fs::remove_dir_all(&dir) {
      Ok(()) => Ok(size),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
      Err(e) => Err(io_err(&dir)(e)),
    }
  }

  fn entries(&self) -> Result<Vec<EntryMeta>, BackendError> {
    let objects = objects_dir(&self.root);
    let read_dir = match std::fs::read_dir(&objects) {
      Ok(read_dir) => read_dir,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(io_err(&objects)(e)),
    };

    let mut entries = Vec::new();
    for dir_entry in read_dir {
      let dir_entry = dir_entry.map_err(io_err(&objects))?;
      let name = dir_entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      if !Fingerprint::is_well_formed(name) {
        continue;
      }
      match Self::read_marker(&dir_entry.path()) {
        Ok(Some(marker)) => entries.push(marker.meta),
        Ok(None) => debug!(entry = name, "skipping incomplete cache entry"),
        Err(e) => warn!(entry = name, error = %e, "skipping cache entry with bad marker"),
      }
    }

    entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(entries)
  }
}
