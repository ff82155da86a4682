//! Eviction policies for the cache.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::artifact::EntryMeta;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EvictionPolicy {
  #[default]
  Never,
  /// Drop least recently used entries until the total fits in `max_bytes`.
  #[serde(rename_all = "camelCase")]
  LeastRecentlyUsed { max_bytes: u64 },
  /// Drop entries not used within `max_age`.
  #[serde(rename_all = "camelCase")]
  OlderThan { max_age: Duration },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
  pub evicted: Vec<Fingerprint>,
  pub bytes_freed: u64,
  pub remaining_entries: usize,
  pub remaining_bytes: u64,
}

/// Entries the policy would remove, oldest first.
///
/// `now` is unix seconds. Ties on `last_used` fall back to fingerprint order
/// so the choice is stable.
pub fn select_victims(policy: EvictionPolicy, entries: &[EntryMeta], now: u64) -> Vec<EntryMeta> {
  let mut by_age: Vec<&EntryMeta> = entries.iter().collect();
  by_age.sort_by(|a, b| {
    a.last_used
      .cmp(&b.last_used)
      .then_with(|| a.fingerprint.cmp(&b.fingerprint))
  });

  match policy {
    EvictionPolicy::Never => Vec::new(),
    EvictionPolicy::LeastRecentlyUsed { max_bytes } => {
      let mut total: u64 = entries.iter().map(|e| e.size).sum();
      let mut victims = Vec::new();
      for entry in by_age {
        if total <= max_bytes {
          break;
        }
        total = total.saturating_sub(entry.size);
        victims.push(entry.clone());
      }
      victims
    }
    EvictionPolicy::OlderThan { max_age } => {
      let cutoff = now.saturating_sub(max_age.as_secs());
      by_age
        .into_iter()
        .filter(|e| e.last_used < cutoff)
        .cloned()
        .collect()
    }
  }
}
