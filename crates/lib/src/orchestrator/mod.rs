//! The per-platform build loop.
//!
//! A run resolves the recipe's sources once, then for every selected
//! platform mounts its shard, creates a workspace, installs dependencies,
//! runs the build, purges dependency files, and packages the prefix. The
//! first failing platform aborts the run. Unpartitioned runs finish by
//! writing `build.json`.
//!
//! ```text
//! Idle -> SourcesResolved -> Building(p)* -> ManifestWritten -> Done
//!                                 \-> Aborted
//! ```

pub mod heartbeat;
pub mod partition;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::build::{self, Auditor, BuildFailure, BuildRequest, Sandbox, SkipAudit};
use crate::config::RunOptions;
use crate::dependency::Dependency;
use crate::dependency::install::{DependencyInstaller, InstallError};
use crate::dependency::purge::{PurgeError, purge};
use crate::manifest::{ArtifactRecord, BuildManifest, ManifestError};
use crate::package::{PackageError, package};
use crate::platform::Platform;
use crate::recipe::{Recipe, RecipeError};
use crate::release::{ReleaseError, ReleaseHost, ReleaseReconstructor};
use crate::shard::{ShardError, ShardMount, ShardPool};
use crate::source::{ResolvedSource, SourceError, SourceResolver};
use crate::workspace::{Workspace, WorkspaceError};

use heartbeat::Heartbeat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  Idle,
  SourcesResolved,
  Building(Platform),
  ManifestWritten,
  Done,
  Aborted,
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunState::Idle => f.write_str("idle"),
      RunState::SourcesResolved => f.write_str("sources resolved"),
      RunState::Building(platform) => write!(f, "building {platform}"),
      RunState::ManifestWritten => f.write_str("manifest written"),
      RunState::Done => f.write_str("done"),
      RunState::Aborted => f.write_str("aborted"),
    }
  }
}

/// Step of a platform's build a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Mount,
  Workspace,
  Install,
  Build,
  Purge,
  Package,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Phase::Mount => "mount",
      Phase::Workspace => "workspace",
      Phase::Install => "install",
      Phase::Build => "build",
      Phase::Purge => "purge",
      Phase::Package => "package",
    })
  }
}

#[derive(Debug, Error)]
pub enum PhaseError {
  #[error(transparent)]
  Shard(#[from] ShardError),

  #[error(transparent)]
  Workspace(#[from] WorkspaceError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error(transparent)]
  Build(#[from] BuildFailure),

  #[error(transparent)]
  Purge(#[from] PurgeError),

  #[error(transparent)]
  Package(#[from] PackageError),
}

impl PhaseError {
  pub fn phase(&self) -> Phase {
    match self {
      PhaseError::Shard(_) => Phase::Mount,
      PhaseError::Workspace(_) => Phase::Workspace,
      PhaseError::Install(_) => Phase::Install,
      PhaseError::Build(_) => Phase::Build,
      PhaseError::Purge(_) => Phase::Purge,
      PhaseError::Package(_) => Phase::Package,
    }
  }
}

#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error("failed to resolve sources: {0}")]
  Sources(#[from] SourceError),

  #[error("{platform} failed during {phase}: {source}")]
  Platform {
    platform: Platform,
    phase: Phase,
    #[source]
    source: PhaseError,
  },

  #[error("failed to write manifest: {0}")]
  Manifest(#[from] ManifestError),

  #[error("failed to read release: {0}")]
  Release(#[from] ReleaseError),
}

impl RunError {
  fn platform(platform: Platform, source: PhaseError) -> Self {
    RunError::Platform {
      platform,
      phase: source.phase(),
      source,
    }
  }
}

#[derive(Debug)]
pub struct RunReport {
  pub state: RunState,
  pub artifacts: BTreeMap<Platform, ArtifactRecord>,
  pub manifest_path: Option<PathBuf>,
}

pub struct Orchestrator<S, H> {
  sandbox: S,
  auditor: Box<dyn Auditor>,
  pool: ShardPool,
  resolver: SourceResolver,
  installer: DependencyInstaller,
  host: H,
  options: RunOptions,
}

impl<S: Sandbox, H: ReleaseHost + Clone> Orchestrator<S, H> {
  pub fn new(sandbox: S, pool: ShardPool, host: H, options: RunOptions) -> Self {
    Self {
      sandbox,
      auditor: Box::new(SkipAudit),
      pool,
      resolver: SourceResolver::default(),
      installer: DependencyInstaller::default(),
      host,
      options,
    }
  }

  pub fn with_auditor(mut self, auditor: impl Auditor + 'static) -> Self {
    self.auditor = Box::new(auditor);
    self
  }

  pub fn with_resolver(mut self, resolver: SourceResolver) -> Self {
    self.resolver = resolver;
    self
  }

  pub fn with_installer(mut self, installer: DependencyInstaller) -> Self {
    self.installer = installer;
    self
  }

  pub fn options(&self) -> &RunOptions {
    &self.options
  }

  pub fn sandbox(&self) -> &S {
    &self.sandbox
  }

  /// Platforms this run builds, after the override and the partition.
  pub fn selected_platforms(&self, recipe: &Recipe) -> Vec<Platform> {
    let mut all = self.options.platforms.clone().unwrap_or_else(|| recipe.platforms());
    let mut seen = std::collections::BTreeSet::new();
    all.retain(|platform| seen.insert(*platform));

    match &self.options.partition {
      Some(partition) => {
        let selected = partition.select(&all).to_vec();
        info!(
          partition = %partition,
          total = all.len(),
          selected = selected.len(),
          "building one part of the platform list"
        );
        selected
      }
      None => all,
    }
  }

  /// Run the recipe. Every shard is released and the heartbeat is stopped
  /// before this returns, on success and on failure.
  pub async fn run(&self, recipe: &Recipe) -> Result<RunReport, RunError> {
    let heartbeat = Heartbeat::start_if_noninteractive(self.options.heartbeat);
    let mut state = RunState::Idle;

    let result = if self.options.only_manifest {
      self.manifest_from_release(recipe, &mut state).await
    } else {
      self.build_all(recipe, &mut state).await
    };

    let leftover = self.pool.release_all();
    if leftover > 0 {
      debug!(leftover, "released shards after run");
    }
    if let Some(heartbeat) = heartbeat {
      let beats = heartbeat.stop().await;
      debug!(beats, "heartbeat stopped");
    }

    if result.is_err() {
      transition(&mut state, RunState::Aborted);
    }
    result
  }

  async fn build_all(&self, recipe: &Recipe, state: &mut RunState) -> Result<RunReport, RunError> {
    let platforms = self.selected_platforms(recipe);
    let dependencies = recipe.load_dependencies()?;

    let sources = if platforms.is_empty() {
      Vec::new()
    } else {
      self.resolver.resolve_all(&recipe.sources).await?
    };
    transition(state, RunState::SourcesResolved);

    let mut artifacts = BTreeMap::new();
    for platform in platforms {
      transition(state, RunState::Building(platform));
      let record = self
        .pool
        .scoped(&platform, |mount| self.build_platform(recipe, &sources, &dependencies, mount))
        .await
        .map_err(|source| RunError::platform(platform, source))?;
      artifacts.insert(platform, record);
    }

    let manifest_path = match &self.options.partition {
      Some(partition) => {
        info!(partition = %partition, "partitioned run, not writing a manifest");
        None
      }
      None => {
        let path = self.write_manifest(recipe, &artifacts)?;
        transition(state, RunState::ManifestWritten);
        Some(path)
      }
    };

    transition(state, RunState::Done);
    Ok(RunReport {
      state: *state,
      artifacts,
      manifest_path,
    })
  }

  async fn build_platform(
    &self,
    recipe: &Recipe,
    sources: &[ResolvedSource],
    dependencies: &[Arc<dyn Dependency>],
    mount: ShardMount,
  ) -> Result<ArtifactRecord, PhaseError> {
    let workspace = Workspace::create(&self.options.build_dir, sources, &mount)?;
    let result = self.build_in(recipe, dependencies, &workspace).await;

    if result.is_err() && self.options.flags.debug {
      info!(path = %workspace.root().display(), "keeping workspace for inspection");
    } else if let Err(err) = workspace.destroy() {
      warn!(error = %err, "failed to remove workspace");
    }
    result
  }

  async fn build_in(
    &self,
    recipe: &Recipe,
    dependencies: &[Arc<dyn Dependency>],
    workspace: &Workspace,
  ) -> Result<ArtifactRecord, PhaseError> {
    let platform = workspace.platform();

    self.installer.install(workspace, dependencies).await?;

    let request = BuildRequest {
      name: &recipe.name,
      products: &recipe.products,
      script: &recipe.script,
      workspace,
    };
    let ignore_manifests = workspace.ignore_manifests();
    build::run(
      &self.sandbox,
      self.auditor.as_ref(),
      &request,
      self.options.flags,
      &ignore_manifests,
    )
    .await?;

    let purged = purge(workspace.prefix(), &platform, dependencies)?;
    if purged > 0 {
      debug!(platform = %platform, files = purged, "purged dependency files");
    }
    workspace.remove_staging()?;
    workspace.remove_empty_manifests_dir()?;

    let record = package(
      workspace.prefix(),
      &self.options.output_dir.join(&recipe.name),
      &recipe.version,
      &platform,
    )?;
    Ok(record)
  }

  async fn manifest_from_release(&self, recipe: &Recipe, state: &mut RunState) -> Result<RunReport, RunError> {
    let reconstruction = ReleaseReconstructor::new(self.host.clone())
      .with_filter(format!("{}.v{}.", recipe.name, recipe.version))
      .reconstruct(&self.options.release)
      .await?;
    if !reconstruction.skipped.is_empty() {
      info!(skipped = reconstruction.skipped.len(), "ignored assets without a platform");
    }

    let path = self.write_manifest(recipe, &reconstruction.artifacts)?;
    transition(state, RunState::ManifestWritten);
    transition(state, RunState::Done);
    Ok(RunReport {
      state: *state,
      artifacts: reconstruction.artifacts,
      manifest_path: Some(path),
    })
  }

  fn write_manifest(
    &self,
    recipe: &Recipe,
    artifacts: &BTreeMap<Platform, ArtifactRecord>,
  ) -> Result<PathBuf, ManifestError> {
    if self.options.release.is_placeholder() {
      warn!("manifest download urls contain placeholders");
    }
    let mut manifest = BuildManifest::new(
      recipe.name.clone(),
      recipe.version.clone(),
      recipe.products.clone(),
      self.options.release.bin_path(),
    );
    for (platform, record) in artifacts {
      manifest.insert(*platform, record.clone());
    }
    manifest.write(&self.options.output_dir)
  }
}

fn transition(state: &mut RunState, next: RunState) {
  debug!(from = %state, to = %next, "run state");
  *state = next;
}

#[cfg(test)]
mod tests {
  use super::partition::Partition;
  use super::*;
  use crate::build::Product;
  use crate::config::ReleaseTarget;
  use crate::recipe::ReleaseConfig;
  use crate::shard::mounter::DirectoryMounter;
  use crate::util::testutil::{DirectoryReleases, ScriptedSandbox};
  use std::path::Path;
  use tempfile::TempDir;

  fn recipe(platforms: Vec<Platform>) -> Recipe {
    Recipe {
      name: "libfoo".to_string(),
      version: "1.2.3".to_string(),
      platforms: Some(platforms),
      script: "make install".to_string(),
      sources: vec![],
      products: vec![Product::File {
        path: "share/libfoo/README".to_string(),
      }],
      dependencies: vec![],
      release: ReleaseConfig::default(),
      dir: PathBuf::from("."),
    }
  }

  fn platforms(names: &[&str]) -> Vec<Platform> {
    names.iter().map(|n| n.parse().unwrap()).collect()
  }

  fn options(root: &Path, output: &str) -> RunOptions {
    let mut options = RunOptions::new(ReleaseTarget::new("org/libfoo-builder", "v1.2.3"));
    options.build_dir = root.join("build");
    options.output_dir = root.join(output);
    options
  }

  fn orchestrator(
    root: &Path,
    sandbox: ScriptedSandbox,
    options: RunOptions,
  ) -> Orchestrator<ScriptedSandbox, DirectoryReleases> {
    let pool = ShardPool::new(DirectoryMounter::new(root.join("shards")).create_missing(true), 2);
    let releases = DirectoryReleases::new(&options.output_dir);
    Orchestrator::new(sandbox, pool, releases, options)
  }

  fn producing_readme() -> ScriptedSandbox {
    ScriptedSandbox::producing(&["share/libfoo/README", "share/libfoo/{triplet}.txt"])
  }

  #[tokio::test]
  async fn builds_every_platform_and_writes_manifest() {
    let temp = TempDir::new().unwrap();
    let targets = platforms(&["x86_64-linux-gnu", "aarch64-linux-gnu"]);
    let orch = orchestrator(temp.path(), producing_readme(), options(temp.path(), "products"));

    let report = orch.run(&recipe(targets.clone())).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.artifacts.len(), 2);
    for platform in &targets {
      let name = &report.artifacts[platform].file_name;
      assert_eq!(name, &format!("libfoo.v1.2.3.{}.tar.gz", platform.triplet()));
      assert!(temp.path().join("products").join(name).is_file());
    }

    let manifest = BuildManifest::load(report.manifest_path.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.platforms().count(), 2);
    assert_eq!(
      manifest.download_url(&targets[0]).unwrap(),
      "https://github.com/org/libfoo-builder/releases/download/v1.2.3/libfoo.v1.2.3.x86_64-linux-gnu.tar.gz"
    );

    // Workspaces are removed and every shard released.
    assert!(!temp.path().join("build/x86_64-linux-gnu").exists());
    assert_eq!(orch.pool.mounted_count(), 0);
  }

  #[tokio::test]
  async fn failing_script_aborts_run() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(temp.path(), ScriptedSandbox::failing(2), options(temp.path(), "products"));

    let err = orch
      .run(&recipe(platforms(&["x86_64-linux-gnu", "aarch64-linux-gnu"])))
      .await
      .unwrap_err();

    match err {
      RunError::Platform {
        platform,
        phase,
        source: PhaseError::Build(BuildFailure::BuildScriptFailed { code, .. }),
      } => {
        assert_eq!(platform.triplet(), "x86_64-linux-gnu");
        assert_eq!(phase, Phase::Build);
        assert_eq!(code, Some(2));
      }
      other => panic!("unexpected error: {other}"),
    }
    assert_eq!(orch.sandbox().executions().len(), 1);
    assert_eq!(orch.sandbox().shells_opened(), 0);
    assert!(!temp.path().join("build/x86_64-linux-gnu").exists());
    assert!(!temp.path().join("products/build.json").exists());
    assert_eq!(orch.pool.mounted_count(), 0);
  }

  #[tokio::test]
  async fn debug_mode_opens_shell_and_keeps_workspace() {
    let temp = TempDir::new().unwrap();
    let mut opts = options(temp.path(), "products");
    opts.flags.debug = true;
    let orch = orchestrator(temp.path(), ScriptedSandbox::failing(1), opts);

    let err = orch.run(&recipe(platforms(&["x86_64-linux-gnu"]))).await.unwrap_err();

    assert!(matches!(err, RunError::Platform { phase: Phase::Build, .. }));
    assert_eq!(orch.sandbox().shells_opened(), 1);
    assert!(temp.path().join("build/x86_64-linux-gnu/destdir").is_dir());
  }

  #[tokio::test]
  async fn missing_product_fails_build_phase() {
    let temp = TempDir::new().unwrap();
    let sandbox = ScriptedSandbox::producing(&["share/other"]);
    let orch = orchestrator(temp.path(), sandbox, options(temp.path(), "products"));

    let err = orch.run(&recipe(platforms(&["x86_64-linux-musl"]))).await.unwrap_err();
    assert!(matches!(
      err,
      RunError::Platform {
        source: PhaseError::Build(BuildFailure::ProductMissing { .. }),
        ..
      }
    ));
  }

  #[derive(Debug)]
  struct RejectAll;

  impl Auditor for RejectAll {
    fn audit(&self, prefix: &Path, _ignore_manifests: &[PathBuf]) -> Result<(), crate::build::AuditError> {
      Err(crate::build::AuditError::Rejected {
        path: prefix.to_path_buf(),
        reason: "not relocatable".to_string(),
      })
    }
  }

  #[tokio::test]
  async fn audit_rejection_fails_build_phase() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(temp.path(), producing_readme(), options(temp.path(), "products")).with_auditor(RejectAll);

    let err = orch.run(&recipe(platforms(&["x86_64-linux-gnu"]))).await.unwrap_err();
    assert!(matches!(
      err,
      RunError::Platform {
        phase: Phase::Build,
        source: PhaseError::Build(BuildFailure::Audit(_)),
        ..
      }
    ));
    assert!(!temp.path().join("products/libfoo.v1.2.3.x86_64-linux-gnu.tar.gz").exists());
  }

  #[tokio::test]
  async fn partition_builds_its_slice_without_manifest() {
    let temp = TempDir::new().unwrap();
    let all: Vec<Platform> = Platform::supported().into_iter().take(9).collect();
    let mut opts = options(temp.path(), "products");
    opts.partition = Some("2/3".parse().unwrap());
    let orch = orchestrator(temp.path(), producing_readme(), opts);

    let report = orch.run(&recipe(all.clone())).await.unwrap();

    assert_eq!(orch.sandbox().executions(), all[3..6].to_vec());
    assert_eq!(report.artifacts.keys().copied().collect::<Vec<_>>(), {
      let mut expected = all[3..6].to_vec();
      expected.sort();
      expected
    });
    assert!(report.manifest_path.is_none());
    assert!(!temp.path().join("products/build.json").exists());
  }

  #[tokio::test]
  async fn merged_partitions_match_unpartitioned_run() {
    let temp = TempDir::new().unwrap();
    let all: Vec<Platform> = Platform::supported().into_iter().take(5).collect();

    let whole = orchestrator(temp.path(), producing_readme(), options(temp.path(), "whole"))
      .run(&recipe(all.clone()))
      .await
      .unwrap();

    for part in 1..=2 {
      let mut opts = options(temp.path(), "parts");
      opts.partition = Some(Partition::new(part, 2).unwrap());
      orchestrator(temp.path(), producing_readme(), opts)
        .run(&recipe(all.clone()))
        .await
        .unwrap();
    }

    let mut opts = options(temp.path(), "parts");
    opts.only_manifest = true;
    let merged = orchestrator(temp.path(), ScriptedSandbox::default(), opts)
      .run(&recipe(all.clone()))
      .await
      .unwrap();

    assert_eq!(merged.artifacts, whole.artifacts);
    let written = BuildManifest::load(merged.manifest_path.as_ref().unwrap()).unwrap();
    assert_eq!(written.platforms().count(), all.len());
  }

  #[tokio::test]
  async fn manifest_only_ignores_other_versions_in_release() {
    let temp = TempDir::new().unwrap();
    let targets = platforms(&["x86_64-linux-gnu"]);
    orchestrator(temp.path(), producing_readme(), options(temp.path(), "products"))
      .run(&recipe(targets.clone()))
      .await
      .unwrap();
    let products = temp.path().join("products");
    std::fs::write(products.join("libfoo.v1.2.2.aarch64-linux-gnu.tar.gz"), "old").unwrap();
    std::fs::write(products.join("libfoo.v1.2.30.i686-linux-gnu.tar.gz"), "newer").unwrap();

    let mut opts = options(temp.path(), "products");
    opts.only_manifest = true;
    let report = orchestrator(temp.path(), ScriptedSandbox::default(), opts)
      .run(&recipe(targets.clone()))
      .await
      .unwrap();

    assert_eq!(report.artifacts.keys().copied().collect::<Vec<_>>(), targets);
    let written = BuildManifest::load(report.manifest_path.as_ref().unwrap()).unwrap();
    assert_eq!(written.platforms().count(), 1);
  }

  #[tokio::test]
  async fn platform_override_wins_over_recipe() {
    let temp = TempDir::new().unwrap();
    let mut opts = options(temp.path(), "products");
    opts.platforms = Some(platforms(&["aarch64-linux-musl", "aarch64-linux-musl"]));
    let orch = orchestrator(temp.path(), producing_readme(), opts);

    let report = orch.run(&recipe(platforms(&["x86_64-linux-gnu"]))).await.unwrap();
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(orch.sandbox().executions(), platforms(&["aarch64-linux-musl"]));
  }
}
