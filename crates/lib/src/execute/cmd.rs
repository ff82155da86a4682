//! Executes `exec` actions as isolated child processes.
//!
//! Each request gets a fresh temporary directory holding:
//! - `work/`: the declared context files with upstream outputs overlaid, used
//!   as the working directory
//! - `out/`: exported as `$out`; everything written here is the artifact
//! - `tmp/`: exported as `TMPDIR`
//!
//! The environment is cleared first. Variables the action declares are merged
//! last, so an action that needs tools on `PATH` has to say so.
//!
//! Staging inputs and collecting outputs are blocking filesystem walks and run
//! on tokio's blocking pool.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::executor::{ActionError, ActionExecutor, ActionRequest};
use crate::cache::Artifact;
use crate::step::{Action, ExecOpts};

/// January 1, 1980 00:00:00 UTC, the earliest time zip archives can hold.
const SOURCE_DATE_EPOCH: &str = "315532800";

#[derive(Debug, Clone, Default)]
pub struct CmdExecutor;

impl CmdExecutor {
  pub fn new() -> Self {
    Self
  }

  async fn run(&self, opts: &ExecOpts, request: &ActionRequest) -> Result<Artifact, ActionError> {
    let sandbox = tempfile::Builder::new().prefix("strata-step-").tempdir()?;
    let work = sandbox.path().join("work");
    let out = sandbox.path().join("out");
    let tmp = sandbox.path().join("tmp");
    for dir in [&work, &out, &tmp] {
      tokio::fs::create_dir_all(dir).await?;
    }

    let staging = {
      let work = work.clone();
      let context_dir = request.context_dir.clone();
      let context_files = request.context_files.clone();
      let upstream: Vec<Arc<Artifact>> = request.upstream.iter().map(|(_, a)| a.clone()).collect();
      tokio::task::spawn_blocking(move || -> io::Result<()> {
        for file in &context_files {
          copy_into(&context_dir.join(file), &work.join(file))?;
        }
        for artifact in &upstream {
          artifact.write_to(&work)?;
        }
        Ok(())
      })
    };
    staging.await.map_err(io::Error::other)??;

    let cmd = render_cmd(opts);
    info!(step = %request.step, cmd = %cmd, "executing command");

    let mut command = Command::new(&opts.bin);
    command
      .args(&opts.args)
      .current_dir(&work)
      .env_clear()
      .env("PATH", "/path-not-set")
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", &tmp)
      .env("TMP", &tmp)
      .env("TEMP", &tmp)
      .env("out", &out)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .kill_on_drop(true);

    for (id, path) in &request.mounts {
      command.env(mount_env_var(id), path);
    }
    for (name, value) in &request.params {
      command.env(param_env_var(name), value);
    }
    for (key, value) in &opts.env {
      command.env(key, value);
    }

    debug!(step = %request.step, work = ?work, "spawning process");
    let output = command.output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
      debug!(step = %request.step, stdout = %stdout, "command output");
    }

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
      debug!(step = %request.step, stderr = %stderr, "command stderr");
      return Err(ActionError::CmdFailed {
        cmd,
        code: output.status.code(),
        stderr,
      });
    }

    let artifact = tokio::task::spawn_blocking(move || Artifact::from_dir(&out, &[]))
      .await
      .map_err(io::Error::other)??;
    debug!(step = %request.step, files = artifact.len(), bytes = artifact.size(), "collected outputs");
    Ok(artifact)
  }
}

impl ActionExecutor for CmdExecutor {
  async fn execute(&self, request: ActionRequest) -> Result<Artifact, ActionError> {
    match &request.action {
      Action::Exec(opts) => self.run(opts, &request).await,
      Action::Custom { name, .. } => Err(ActionError::Unsupported(format!(
        "custom action '{name}' needs an embedding executor"
      ))),
    }
  }
}

fn render_cmd(opts: &ExecOpts) -> String {
  std::iter::once(opts.bin.as_str())
    .chain(opts.args.iter().map(String::as_str))
    .collect::<Vec<_>>()
    .join(" ")
}

/// `STRATA_MOUNT_<ID>` with the id upper-cased and non-alphanumerics as `_`.
pub fn mount_env_var(id: &str) -> String {
  format!("STRATA_MOUNT_{}", env_suffix(id))
}

/// `STRATA_PARAM_<NAME>` with the same rules as [`mount_env_var`].
pub fn param_env_var(name: &str) -> String {
  format!("STRATA_PARAM_{}", env_suffix(name))
}

fn env_suffix(value: &str) -> String {
  value
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect()
}

/// Copy a file, or a directory recursively, to `dest`.
fn copy_into(src: &Path, dest: &Path) -> io::Result<()> {
  if src.is_file() {
    if let Some(parent) = dest.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest)?;
    return Ok(());
  }

  for entry in WalkDir::new(src) {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target)?;
    } else if entry.file_type().is_file() {
      std::fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}
