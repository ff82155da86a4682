//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, human-readable byte/duration formatting, and Unicode symbols.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use strata_lib::step::StepStatus;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const CACHED: &str = "↺";
  pub const PENDING: &str = "·";
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  if bytes >= GB {
    format!("{:.1} GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1} MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1} KB", bytes as f64 / KB as f64)
  } else {
    format!("{} B", bytes)
  }
}

/// Parse a byte count such as `512`, `64K`, `1.5M` or `2G` (binary units).
pub fn parse_size(input: &str) -> Result<u64, String> {
  let trimmed = input.trim();
  let upper = trimmed.to_ascii_uppercase();
  let upper = upper.strip_suffix('B').filter(|s| !s.is_empty()).unwrap_or(&upper);

  let (number, multiplier) = match upper.chars().last() {
    Some('K') => (&upper[..upper.len() - 1], 1024u64),
    Some('M') => (&upper[..upper.len() - 1], 1024 * 1024),
    Some('G') => (&upper[..upper.len() - 1], 1024 * 1024 * 1024),
    _ => (upper, 1),
  };

  let value: f64 = number
    .trim()
    .parse()
    .map_err(|_| format!("invalid size '{trimmed}': expected a number with an optional K, M or G suffix"))?;
  if !value.is_finite() || value < 0.0 {
    return Err(format!("invalid size '{trimmed}'"));
  }
  Ok((value * multiplier as f64) as u64)
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// One line per step: status symbol, id, then details.
pub fn print_step(status: StepStatus, id: &str, detail: &str) {
  let symbol = match status {
    StepStatus::Done => symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
    StepStatus::Cached => symbols::CACHED.if_supports_color(Stream::Stdout, |s| s.cyan()).to_string(),
    StepStatus::Failed => symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
    StepStatus::Pending | StepStatus::Ready | StepStatus::Running => symbols::PENDING.to_string(),
  };
  println!(
    "  {} {} {}",
    symbol,
    id,
    detail.if_supports_color(Stream::Stdout, |s| s.dimmed())
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
