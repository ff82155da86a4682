//! Hashing utilities for fingerprints and cache verification.
//!
//! This module provides:
//! - `ContentHash`: a full 64-character SHA-256 hex digest
//! - `hash_directory()`: deterministic directory hashing
//! - `hash_file()`: single file hashing
//! - `hash_path()`: file or directory, whichever the path is

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A full 64-character SHA-256 hash of some content.
///
/// The hash is a lowercase hexadecimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing files on disk.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to walk directory {path}: {message}")]
  WalkDir { path: String, message: String },

  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

fn read_error(path: &Path, source: std::io::Error) -> HashError {
  HashError::Read {
    path: path.display().to_string(),
    source,
  }
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure and symlink targets,
/// but not timestamps or permissions. Entries are sorted by relative path and
/// path separators are normalized to `/` so the hash is platform independent.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, HashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    let entry_path = entry.path();

    let rel_path = normalize(entry_path.strip_prefix(path).unwrap_or(entry_path));
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let line = if file_type.is_file() {
      format!("F:{}:{}", rel_path, hash_file(entry_path)?)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| read_error(entry_path, e))?;
      format!("L:{}:{}", rel_path, hash_bytes(normalize(&target).as_bytes()))
    } else {
      continue;
    };

    entries.push((rel_path, line));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, line) in entries {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut file = fs::File::open(path).map_err(|e| read_error(path, e))?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| read_error(path, e))?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a path that may be either a file or a directory.
///
/// Returns the hash and whether the path was a directory.
pub fn hash_path(path: &Path) -> Result<(ContentHash, bool), HashError> {
  let metadata = fs::metadata(path).map_err(|e| read_error(path, e))?;
  if metadata.is_dir() {
    Ok((hash_directory(path, &[])?, true))
  } else {
    Ok((hash_file(path)?, false))
  }
}

fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

/// Render a relative path with `/` separators.
pub(crate) fn normalize(path: &Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}
