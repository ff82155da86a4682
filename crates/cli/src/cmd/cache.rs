//! Implementation of the `strata cache` commands.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use strata_lib::cache::{CacheStore, EvictionPolicy, LockMode};
use strata_lib::paths::cache_dir;

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub struct GcArgs {
  pub max_size: Option<u64>,
  pub max_age: Option<Duration>,
  pub dry_run: bool,
}

#[derive(Serialize)]
struct StatsOutput {
  root: String,
  entries: usize,
  bytes: u64,
}

#[derive(Serialize)]
struct GcOutput {
  dry_run: bool,
  evicted: Vec<String>,
  bytes_freed: u64,
  remaining_entries: usize,
  remaining_bytes: u64,
}

pub fn cmd_cache_stats(output: OutputFormat) -> Result<()> {
  let root = cache_dir();
  let store = CacheStore::open(&root, LockMode::Shared, "cache stats")
    .with_context(|| format!("Failed to open cache: {}", root.display()))?;
  let stats = store.stats().context("Failed to read cache")?;

  if output.is_json() {
    return print_json(&StatsOutput {
      root: root.display().to_string(),
      entries: stats.entries,
      bytes: stats.bytes,
    });
  }

  print_info(&format!("Cache at {}", root.display()));
  print_stat("Entries", &stats.entries.to_string());
  print_stat("Size", &format_bytes(stats.bytes));
  Ok(())
}

pub fn cmd_cache_gc(args: GcArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let policy = match (args.max_size, args.max_age) {
    (Some(max_bytes), _) => EvictionPolicy::LeastRecentlyUsed { max_bytes },
    (None, Some(max_age)) => EvictionPolicy::OlderThan { max_age },
    (None, None) => EvictionPolicy::Never,
  };

  let root = cache_dir();
  let store = CacheStore::open(&root, LockMode::Exclusive, "cache gc").context("Failed to acquire cache lock")?;

  let result = if args.dry_run {
    let victims = store.eviction_candidates(policy).context("Failed to read cache")?;
    let stats = store.stats().context("Failed to read cache")?;
    let bytes_freed: u64 = victims.iter().map(|v| v.size).sum();
    GcOutput {
      dry_run: true,
      remaining_entries: stats.entries - victims.len(),
      remaining_bytes: stats.bytes.saturating_sub(bytes_freed),
      bytes_freed,
      evicted: victims.into_iter().map(|v| v.fingerprint.to_string()).collect(),
    }
  } else {
    let report = store.evict(policy).context("Failed to evict cache entries")?;
    GcOutput {
      dry_run: false,
      evicted: report.evicted.iter().map(|f| f.to_string()).collect(),
      bytes_freed: report.bytes_freed,
      remaining_entries: report.remaining_entries,
      remaining_bytes: report.remaining_bytes,
    }
  };

  if output.is_json() {
    return print_json(&result);
  }

  println!();
  if result.dry_run {
    print_info("Dry run - no changes made");
  } else {
    print_success("Cache cleanup complete!");
  }
  print_stat("Entries removed", &result.evicted.len().to_string());
  print_stat("Space freed", &format_bytes(result.bytes_freed));
  print_stat("Remaining", &format!("{} ({})", result.remaining_entries, format_bytes(result.remaining_bytes)));
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
