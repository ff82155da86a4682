//! strata-lib: incremental build engine
//!
//! This crate schedules declared build steps with content-addressed caching:
//! - `step`: step declarations and their lifecycle states
//! - `graph`: the validated dependency graph of steps and stages
//! - `fingerprint`: deterministic cache keys derived from step inputs
//! - `cache`: the artifact cache, its backends, mounts and eviction
//! - `execute`: the parallel scheduler and action executors
//! - `materialize`: assembling selected stages into a final artifact

pub mod cache;
pub mod consts;
pub mod execute;
pub mod fingerprint;
pub mod graph;
pub mod materialize;
pub mod paths;
pub mod step;
pub mod util;
