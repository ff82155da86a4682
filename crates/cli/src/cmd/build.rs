//! Implementation of the `strata build` command.
//!
//! Loads step declarations, runs them against the on-disk cache and
//! optionally exports selected stages into a directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use strata_lib::cache::{CacheStore, LockMode};
use strata_lib::execute::{CmdExecutor, ExecuteConfig, RunReport, Scheduler};
use strata_lib::materialize::materialize;
use strata_lib::paths::cache_dir;
use strata_lib::step::{BuildFile, StepStatus};

use super::resolve_context;
use crate::output::{
  OutputFormat, format_bytes, format_duration, print_error, print_json, print_stat, print_step, print_success,
  print_warning,
};

pub struct BuildArgs {
  pub file: PathBuf,
  pub context: Option<PathBuf>,
  pub stages: Vec<String>,
  pub out: Option<PathBuf>,
  pub jobs: Option<usize>,
  pub fail_fast: bool,
  pub step_timeout: Option<Duration>,
  pub cache_capacity: Option<u64>,
}

#[derive(Serialize)]
struct BuildSummary {
  success: bool,
  executed: usize,
  cached: usize,
  failed: usize,
  not_started: usize,
  elapsed_ms: u64,
  steps: Vec<StepSummary>,
  #[serde(skip_serializing_if = "Option::is_none")]
  exported: Option<ExportSummary>,
}

#[derive(Serialize)]
struct StepSummary {
  id: String,
  status: StepStatus,
  fingerprint: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  duration_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

#[derive(Serialize)]
struct ExportSummary {
  path: PathBuf,
  stages: Vec<String>,
  files: usize,
  bytes: u64,
}

impl BuildSummary {
  fn from_report(report: &RunReport) -> Self {
    Self {
      success: report.is_success(),
      executed: report.executed_count(),
      cached: report.cached_count(),
      failed: report.failed().count(),
      not_started: report.not_started().count(),
      elapsed_ms: report.elapsed.as_millis() as u64,
      steps: report
        .steps
        .iter()
        .map(|s| StepSummary {
          id: s.id.to_string(),
          status: s.status,
          fingerprint: s.fingerprint.to_string(),
          duration_ms: s.duration.map(|d| d.as_millis() as u64),
          error: s.error.as_ref().map(|e| e.to_string()),
        })
        .collect(),
      exported: None,
    }
  }
}

/// Execute the build command.
///
/// Exits with an error if any step failed or was left unstarted; the summary
/// is printed first either way.
pub fn cmd_build(args: BuildArgs, output: OutputFormat) -> Result<()> {
  let build = BuildFile::load(&args.file).with_context(|| format!("Failed to load build file: {}", args.file.display()))?;
  let context = resolve_context(&args.file, args.context.as_deref())?;

  let root = cache_dir();
  let mut store = CacheStore::open(&root, LockMode::Shared, "build")
    .with_context(|| format!("Failed to open cache: {}", root.display()))?;
  if let Some(capacity) = args.cache_capacity {
    store = store.with_capacity(capacity);
  }

  let defaults = ExecuteConfig::default();
  let config = ExecuteConfig {
    max_parallel: args.jobs.unwrap_or(defaults.max_parallel),
    fail_fast: args.fail_fast,
    step_timeout: args.step_timeout,
    ..defaults
  };

  let mut scheduler = Scheduler::from_steps(build.steps, &context, Arc::new(store), CmdExecutor::new(), config)
    .context("Invalid build")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(scheduler.run());
  let mut summary = BuildSummary::from_report(&report);

  if summary.success
    && let Some(out) = &args.out
  {
    let stages = if args.stages.is_empty() {
      match scheduler.graph().stages().last() {
        Some(stage) => vec![stage.name.clone()],
        None => bail!("--out needs a stage to export, but the build declares no stages"),
      }
    } else {
      args.stages.clone()
    };

    let result = materialize(scheduler.graph(), &report, &stages).context("Failed to assemble output")?;
    result.write_to(out).context("Failed to export output")?;
    info!(path = %out.display(), files = result.len(), "exported stages");

    summary.exported = Some(ExportSummary {
      path: out.clone(),
      stages,
      files: result.len(),
      bytes: result.artifact().size(),
    });
  }

  if output.is_json() {
    print_json(&summary)?;
  } else {
    print_text(&report, &summary);
  }

  if !summary.success {
    bail!(
      "Build failed: {} step(s) failed, {} not started",
      summary.failed,
      summary.not_started
    );
  }
  Ok(())
}

fn print_text(report: &RunReport, summary: &BuildSummary) {
  println!();
  for step in &report.steps {
    let detail = match step.status {
      StepStatus::Done => format!(
        "{} in {}",
        step.fingerprint.short(),
        format_duration(step.duration.unwrap_or_default())
      ),
      StepStatus::Cached => format!("{} cached", step.fingerprint.short()),
      StepStatus::Failed => "failed".to_string(),
      _ => "not started".to_string(),
    };
    print_step(step.status, step.id.as_str(), &detail);
  }

  println!();
  for step in report.failed() {
    if let Some(err) = &step.error {
      print_error(&format!("{}: {}", step.id, err));
    }
  }
  if summary.not_started > 0 {
    print_warning(&format!("{} step(s) were not started", summary.not_started));
  }

  if summary.success {
    print_success("Build complete!");
  }
  print_stat("Executed", &summary.executed.to_string());
  print_stat("Cached", &summary.cached.to_string());
  print_stat("Failed", &summary.failed.to_string());
  print_stat("Duration", &format_duration(report.elapsed));
  if let Some(exported) = &summary.exported {
    print_stat(
      "Exported",
      &format!(
        "{} file(s), {} to {}",
        exported.files,
        format_bytes(exported.bytes),
        exported.path.display()
      ),
    );
  }
}
