mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, GcArgs, cmd_build, cmd_cache_gc, cmd_cache_stats, cmd_plan};
use output::{OutputFormat, parse_size};

/// strata - incremental builds with content-addressed caching
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging (RUST_LOG overrides)
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a build, reusing cached step outputs
  Build {
    /// JSON file with the step declarations
    file: PathBuf,

    /// Build context directory (default: the build file's directory)
    #[arg(long)]
    context: Option<PathBuf>,

    /// Stage to export into --out; repeatable (default: the last stage)
    #[arg(long = "stage", value_name = "NAME", requires = "out")]
    stages: Vec<String>,

    /// Directory to export the selected stages into
    #[arg(long)]
    out: Option<PathBuf>,

    /// Maximum number of steps running at once (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Stop starting new steps after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Fail any step running longer than this (e.g. "90s", "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    step_timeout: Option<Duration>,

    /// Cache capacity in bytes; accepts K, M and G suffixes
    #[arg(long, value_parser = parse_size)]
    cache_capacity: Option<u64>,
  },

  /// Validate a build and show steps, fingerprints and parallel waves
  Plan {
    /// JSON file with the step declarations
    file: PathBuf,

    /// Build context directory (default: the build file's directory)
    #[arg(long)]
    context: Option<PathBuf>,
  },

  /// Inspect or clean the artifact cache
  Cache {
    #[command(subcommand)]
    command: CacheCommands,
  },
}

#[derive(Subcommand)]
enum CacheCommands {
  /// Show entry count and size
  Stats,

  /// Evict entries by size or age
  #[command(group(ArgGroup::new("policy").required(true).args(["max_size", "max_age"])))]
  Gc {
    /// Evict least recently used entries until the cache fits (e.g. "2G")
    #[arg(long, value_parser = parse_size)]
    max_size: Option<u64>,

    /// Evict entries not used within this long (e.g. "7days")
    #[arg(long, value_parser = humantime::parse_duration)]
    max_age: Option<Duration>,

    /// Show what would be removed without removing anything
    #[arg(long)]
    dry_run: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build {
      file,
      context,
      stages,
      out,
      jobs,
      fail_fast,
      step_timeout,
      cache_capacity,
    } => cmd_build(
      BuildArgs {
        file,
        context,
        stages,
        out,
        jobs,
        fail_fast,
        step_timeout,
        cache_capacity,
      },
      cli.output,
    ),
    Commands::Plan { file, context } => cmd_plan(&file, context.as_deref(), cli.output),
    Commands::Cache { command } => match command {
      CacheCommands::Stats => cmd_cache_stats(cli.output),
      CacheCommands::Gc {
        max_size,
        max_age,
        dry_run,
      } => cmd_cache_gc(
        GcArgs {
          max_size,
          max_age,
          dry_run,
        },
        cli.output,
      ),
    },
  }
}
