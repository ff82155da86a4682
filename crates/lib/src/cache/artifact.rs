//! Artifacts and cache entry metadata.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::fingerprint::Fingerprint;
use crate::util::hash::{ContentHash, normalize};

/// One path of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactEntry {
  File { contents: Vec<u8>, executable: bool },
  Symlink { target: String },
}

impl ArtifactEntry {
  pub fn file(contents: impl Into<Vec<u8>>) -> Self {
    Self::File {
      contents: contents.into(),
      executable: false,
    }
  }

  pub fn executable(contents: impl Into<Vec<u8>>) -> Self {
    Self::File {
      contents: contents.into(),
      executable: true,
    }
  }

  fn size(&self) -> u64 {
    match self {
      Self::File { contents, .. } => contents.len() as u64,
      Self::Symlink { target } => target.len() as u64,
    }
  }

  fn kind_tag(&self) -> u8 {
    match self {
      Self::File { executable: false, .. } => b'f',
      Self::File { executable: true, .. } => b'x',
      Self::Symlink { .. } => b'l',
    }
  }

  fn body(&self) -> &[u8] {
    match self {
      Self::File { contents, .. } => contents,
      Self::Symlink { target } => target.as_bytes(),
    }
  }
}

/// The output set of a step: relative path to file contents, executable
/// bit, or symlink target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
  entries: BTreeMap<String, ArtifactEntry>,
}

impl Artifact {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
    self.insert(path, contents);
    self
  }

  pub fn with_executable(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
    self.insert_entry(path, ArtifactEntry::executable(contents));
    self
  }

  pub fn with_symlink(mut self, path: impl Into<String>, target: impl Into<String>) -> Self {
    self.insert_entry(path, ArtifactEntry::Symlink { target: target.into() });
    self
  }

  /// Insert a regular, non-executable file.
  pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
    self.insert_entry(path, ArtifactEntry::file(contents));
  }

  pub fn insert_entry(&mut self, path: impl Into<String>, entry: ArtifactEntry) {
    self.entries.insert(path.into(), entry);
  }

  /// Contents of the file at `path`. `None` for symlinks.
  pub fn get(&self, path: &str) -> Option<&[u8]> {
    match self.entries.get(path)? {
      ArtifactEntry::File { contents, .. } => Some(contents),
      ArtifactEntry::Symlink { .. } => None,
    }
  }

  pub fn entry(&self, path: &str) -> Option<&ArtifactEntry> {
    self.entries.get(path)
  }

  /// Entries in path order.
  pub fn entries(&self) -> impl Iterator<Item = (&str, &ArtifactEntry)> {
    self.entries.iter().map(|(p, e)| (p.as_str(), e))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Total content size in bytes. Symlinks count their target length.
  pub fn size(&self) -> u64 {
    self.entries.values().map(ArtifactEntry::size).sum()
  }

  /// Hash over paths, entry kinds and contents, used to verify stored entries.
  pub fn content_hash(&self) -> ContentHash {
    let mut hasher = Sha256::new();
    for (path, entry) in &self.entries {
      hasher.update([entry.kind_tag()]);
      hasher.update((path.len() as u64).to_le_bytes());
      hasher.update(path.as_bytes());
      let body = entry.body();
      hasher.update((body.len() as u64).to_le_bytes());
      hasher.update(body);
    }
    ContentHash(hex::encode(hasher.finalize()))
  }

  /// Keep only the declared outputs.
  ///
  /// A declared entry ending in `/` matches every path below that directory
  /// and must match at least one. Returns the first declared output that
  /// matched nothing.
  pub fn select(&self, declared: &[String]) -> Result<Artifact, String> {
    let mut selected = Artifact::new();

    for output in declared {
      let mut matched = false;
      if output.ends_with('/') {
        for (path, entry) in self.entries.range(output.clone()..) {
          if !path.starts_with(output.as_str()) {
            break;
          }
          selected.entries.insert(path.clone(), entry.clone());
          matched = true;
        }
      } else if let Some(entry) = self.entries.get(output) {
        selected.entries.insert(output.clone(), entry.clone());
        matched = true;
      }

      if !matched {
        return Err(output.clone());
      }
    }

    Ok(selected)
  }

  /// Read every file and symlink below `dir`.
  ///
  /// Top-level names starting with any of `exclude` are skipped. Symlinks are
  /// recorded, never followed.
  pub fn from_dir(dir: &Path, exclude: &[&str]) -> io::Result<Artifact> {
    let mut artifact = Artifact::new();

    let walker = WalkDir::new(dir).sort_by_file_name().into_iter().filter_entry(|e| {
      e.depth() != 1
        || e
          .file_name()
          .to_str()
          .map(|name| !exclude.iter().any(|prefix| name.starts_with(prefix)))
          .unwrap_or(true)
    });

    for entry in walker {
      let entry = entry.map_err(io::Error::other)?;
      let file_type = entry.file_type();
      let rel = normalize(entry.path().strip_prefix(dir).map_err(io::Error::other)?);

      if file_type.is_symlink() {
        let target = std::fs::read_link(entry.path())?;
        let target = target.to_str().ok_or_else(|| {
          io::Error::new(
            io::ErrorKind::InvalidData,
            format!("symlink target is not UTF-8: {}", entry.path().display()),
          )
        })?;
        artifact.insert_entry(rel, ArtifactEntry::Symlink { target: target.to_string() });
      } else if file_type.is_file() {
        let metadata = entry.metadata().map_err(io::Error::other)?;
        artifact.insert_entry(
          rel,
          ArtifactEntry::File {
            contents: std::fs::read(entry.path())?,
            executable: is_executable(&metadata),
          },
        );
      }
    }

    Ok(artifact)
  }

  /// Write every entry below `dir`, creating parent directories and
  /// replacing files already there.
  ///
  /// Refuses paths that leave `dir`, including through a symlink an earlier
  /// entry or artifact put in place.
  pub fn write_to(&self, dir: &Path) -> io::Result<()> {
    for (path, entry) in &self.entries {
      if !is_safe_relative(path) {
        return Err(io::Error::new(
          io::ErrorKind::InvalidInput,
          format!("refusing to write artifact path outside target: {path}"),
        ));
      }
      refuse_symlinked_parents(dir, path)?;

      let target = dir.join(path);
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
      }
      if let Ok(existing) = std::fs::symlink_metadata(&target)
        && !existing.is_dir()
      {
        std::fs::remove_file(&target)?;
      }

      match entry {
        ArtifactEntry::File { contents, executable } => {
          std::fs::write(&target, contents)?;
          if *executable {
            mark_executable(&target)?;
          }
        }
        ArtifactEntry::Symlink { target: link } => create_symlink(link, &target)?,
      }
    }
    Ok(())
  }
}

fn refuse_symlinked_parents(dir: &Path, path: &str) -> io::Result<()> {
  let mut current = dir.to_path_buf();
  let components: Vec<Component<'_>> = Path::new(path).components().collect();
  for component in &components[..components.len().saturating_sub(1)] {
    current.push(component);
    if let Ok(metadata) = std::fs::symlink_metadata(&current)
      && metadata.file_type().is_symlink()
    {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("refusing to write artifact path through a symlink: {path}"),
      ));
    }
  }
  Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
  false
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> io::Result<()> {
  Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(target, link)
}

/// Whether `path` is a non-empty relative path that stays below its root.
fn is_safe_relative(path: &str) -> bool {
  !path.is_empty()
    && Path::new(path)
      .components()
      .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Metadata of a cache entry. Times are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
  pub fingerprint: Fingerprint,
  pub size: u64,
  pub created_at: u64,
  pub last_used: u64,
}

pub fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}
