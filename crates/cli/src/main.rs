//! crossbake: build one package for many platforms.

mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crossbake_lib::orchestrator::partition::Partition;

use crate::output::print_error;

/// Build a recipe for every target platform and write its build.json
#[derive(Parser, Debug)]
#[command(name = "crossbake")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  /// Stream build script output and log at debug level
  #[arg(short, long)]
  verbose: bool,

  /// Open a shell in the sandbox when a build fails, and keep its workspace
  #[arg(long)]
  debug: bool,

  /// Skip building and rebuild build.json from the published release
  #[arg(long = "only-buildjl")]
  only_manifest: bool,

  /// Build only part N of M of the platform list
  #[arg(long, value_name = "N/M")]
  part: Option<Partition>,

  /// Comma-separated platform triplets, overriding the recipe
  #[arg(value_name = "PLATFORMS")]
  platforms: Option<String>,

  /// Recipe to build
  #[arg(long, default_value = "recipe.toml")]
  recipe: PathBuf,

  /// Where per-platform workspaces are created
  #[arg(long, default_value = "build")]
  build_dir: PathBuf,

  /// Where tarballs and build.json are written
  #[arg(long, default_value = "products")]
  output_dir: PathBuf,

  /// Release repository as owner/name
  #[arg(long)]
  repo: Option<String>,

  /// Release tag
  #[arg(long)]
  tag: Option<String>,

  /// Directory holding the platform root filesystem shards
  #[arg(long)]
  shards: Option<PathBuf>,

  /// Treat shards as `{triplet}.squashfs` images and loop-mount them under a writable overlay
  #[arg(long)]
  loopback: bool,

  /// Maximum number of shards mounted at once
  #[arg(long)]
  max_mounts: Option<usize>,

  /// Shell that runs build scripts
  #[arg(long, default_value = "/bin/sh")]
  shell: PathBuf,

  /// How often to log progress when stderr is not a terminal (e.g. "5m")
  #[arg(long, value_parser = humantime::parse_duration)]
  heartbeat: Option<Duration>,
}

fn init_tracing(verbose: bool) {
  let filter = if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cmd::cmd_build(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}
