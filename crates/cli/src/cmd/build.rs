//! Implementation of the `crossbake` build run.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::info;

use crossbake_lib::build::HostSandbox;
use crossbake_lib::config::{ReleaseTarget, RunOptions};
use crossbake_lib::orchestrator::{Orchestrator, RunReport};
use crossbake_lib::platform::{parse_platform_list, paths};
use crossbake_lib::recipe::Recipe;
use crossbake_lib::release::GitHubReleases;
use crossbake_lib::shard::{DirectoryMounter, LoopbackMounter, ShardPool, available_loop_slots};

use crate::Cli;
use crate::output::{print_artifact, print_manifest, print_outcome, print_partial, print_run_header};

/// Load the recipe, run every selected platform, and print a summary.
pub fn cmd_build(cli: Cli) -> Result<()> {
  let start = Instant::now();

  let recipe = Recipe::load(&cli.recipe).with_context(|| format!("Failed to load {}", cli.recipe.display()))?;

  let platforms = match cli.platforms.as_deref() {
    Some(list) => {
      let parsed = parse_platform_list(list).context("Invalid platform list")?;
      if parsed.is_empty() {
        bail!("Platform list '{}' names no platforms", list);
      }
      Some(parsed)
    }
    None => None,
  };

  let release = ReleaseTarget::discover(
    cli.repo.as_deref().or(recipe.release.repo.as_deref()),
    cli.tag.as_deref().or(recipe.release.tag.as_deref()),
    &recipe.dir,
  );
  if cli.only_manifest && release.is_placeholder() {
    bail!("--only-buildjl needs a release repository and tag (use --repo and --tag)");
  }

  let mut options = RunOptions::new(release);
  options.build_dir = absolute_dir(&cli.build_dir)?;
  options.output_dir = absolute_dir(&cli.output_dir)?;
  options.platforms = platforms;
  options.partition = cli.part;
  options.flags.verbose = cli.verbose;
  options.flags.debug = cli.debug;
  options.only_manifest = cli.only_manifest;
  if let Some(period) = cli.heartbeat {
    options.heartbeat = period;
  }

  let shards = cli.shards.unwrap_or_else(paths::shards_dir);
  let max_mounts = cli.max_mounts.unwrap_or_else(available_loop_slots);
  let pool = if cli.loopback {
    let mount_root = options.build_dir.join(".mounts");
    ShardPool::new(LoopbackMounter::new(&shards, mount_root), max_mounts)
  } else {
    ShardPool::new(DirectoryMounter::new(&shards), max_mounts)
  };
  info!(shards = %shards.display(), max_mounts, "shard pool ready");

  let selected = options.platforms.as_ref().map_or_else(|| recipe.platforms().len(), Vec::len);
  print_run_header(
    &recipe.name,
    &recipe.version,
    selected,
    options.partition.as_ref(),
    options.only_manifest,
  );

  let sandbox = HostSandbox::default().with_shell(cli.shell);
  let orchestrator = Orchestrator::new(sandbox, pool, GitHubReleases::from_env(), options);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(orchestrator.run(&recipe)).context("Build failed")?;

  print_summary(&report, orchestrator.options().output_dir.as_path());
  print_outcome(&recipe.name, &recipe.version, report.artifacts.len(), start.elapsed());
  Ok(())
}

/// Create `dir` and return its canonical path. Build scripts run from the
/// source directory, so the paths they are given must be absolute.
fn absolute_dir(dir: &Path) -> Result<PathBuf> {
  std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
  dunce::canonicalize(dir).with_context(|| format!("Failed to resolve {}", dir.display()))
}

fn print_summary(report: &RunReport, output_dir: &Path) {
  println!();
  for (platform, record) in &report.artifacts {
    let size = std::fs::metadata(output_dir.join(&record.file_name)).ok().map(|md| md.len());
    print_artifact(&platform.triplet(), record, size);
  }

  match &report.manifest_path {
    Some(path) => print_manifest(path),
    None => print_partial(output_dir),
  }
}
