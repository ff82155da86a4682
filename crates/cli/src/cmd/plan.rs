//! Implementation of the `strata plan` command.
//!
//! Validates the build graph and computes fingerprints without running
//! anything, reporting which steps the cache already covers.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use strata_lib::cache::{CacheStore, LockMode};
use strata_lib::fingerprint::FingerprintEngine;
use strata_lib::graph::StepGraph;
use strata_lib::paths::cache_dir;
use strata_lib::step::BuildFile;

use super::resolve_context;
use crate::output::{OutputFormat, print_info, print_json, print_stat};

#[derive(Serialize)]
struct PlanStep {
  id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  stage: Option<String>,
  fingerprint: String,
  dependencies: Vec<String>,
  cached: bool,
}

#[derive(Serialize)]
struct PlanOutput {
  steps: Vec<PlanStep>,
  waves: Vec<Vec<String>>,
  to_run: usize,
  cached: usize,
}

pub fn cmd_plan(file: &Path, context: Option<&Path>, output: OutputFormat) -> Result<()> {
  let build = BuildFile::load(file).with_context(|| format!("Failed to load build file: {}", file.display()))?;
  let context = resolve_context(file, context)?;

  let graph = StepGraph::build(build.steps).context("Invalid build graph")?;
  let fingerprints = FingerprintEngine::new(&context)
    .fingerprint_graph(&graph)
    .context("Failed to fingerprint steps")?;

  // Planning never creates a cache.
  let root = cache_dir();
  let store = if root.exists() {
    Some(CacheStore::open(&root, LockMode::Shared, "plan").with_context(|| format!("Failed to open cache: {}", root.display()))?)
  } else {
    None
  };

  let mut steps = Vec::with_capacity(graph.len());
  for (index, step) in graph.steps() {
    let cached = match &store {
      Some(store) => store.contains(&fingerprints[index])?,
      None => false,
    };
    steps.push(PlanStep {
      id: step.id.to_string(),
      stage: step.stage.clone(),
      fingerprint: fingerprints[index].to_string(),
      dependencies: graph
        .dependencies(index)
        .into_iter()
        .map(|dep| graph.step(dep).id.to_string())
        .collect(),
      cached,
    });
  }

  let waves: Vec<Vec<String>> = graph
    .waves()
    .into_iter()
    .map(|wave| wave.into_iter().map(|i| graph.step(i).id.to_string()).collect())
    .collect();
  let cached = steps.iter().filter(|s| s.cached).count();
  let plan = PlanOutput {
    to_run: steps.len() - cached,
    cached,
    steps,
    waves,
  };

  if output.is_json() {
    return print_json(&plan);
  }

  for (number, wave) in plan.waves.iter().enumerate() {
    println!("Wave {}:", number + 1);
    for id in wave {
      let Some(step) = plan.steps.iter().find(|s| &s.id == id) else {
        continue;
      };
      let state = if step.cached { "cached" } else { "to run" };
      let after = if step.dependencies.is_empty() {
        String::new()
      } else {
        format!(" after {}", step.dependencies.join(", "))
      };
      println!("  {} {} ({}){}", id, &step.fingerprint[..12.min(step.fingerprint.len())], state, after);
    }
  }

  println!();
  print_info(&format!("{} step(s) in {} wave(s)", plan.steps.len(), plan.waves.len()));
  print_stat("To run", &plan.to_run.to_string());
  print_stat("Cached", &plan.cached.to_string());
  Ok(())
}
