//! Per-platform build trees.
//!
//! ```text
//! {build_dir}/{triplet}/
//!   srcdir/              resolved sources, materialized
//!   destdir/             install prefix, packaged at the end
//!     .staging/          dependency tarballs while installing
//!     manifests/*.list   files each dependency installed
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::consts::{MANIFESTS_DIR, STAGING_DIR};
use crate::platform::Platform;
use crate::shard::ShardMount;
use crate::source::{ResolvedSource, SourceError};

#[derive(Debug, Error)]
pub enum WorkspaceError {
  #[error("failed to remove stale workspace {path}: {source}")]
  Stale {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to create {path}: {source}")]
  Create {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to materialize source: {0}")]
  Source(#[from] SourceError),

  #[error("failed to clean up {path}: {source}")]
  Cleanup {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// The private build tree of one platform.
#[derive(Debug)]
pub struct Workspace {
  root: PathBuf,
  srcdir: PathBuf,
  prefix: PathBuf,
  shard: ShardMount,
}

impl Workspace {
  /// Create a fresh workspace for `shard.platform` and materialize `sources`
  /// into it. A leftover tree from an earlier run is removed first.
  pub fn create(build_dir: &Path, sources: &[ResolvedSource], shard: &ShardMount) -> Result<Self, WorkspaceError> {
    let root = build_dir.join(shard.platform.triplet());
    if root.exists() {
      info!(path = %root.display(), "removing stale workspace");
      fs::remove_dir_all(&root).map_err(|source| WorkspaceError::Stale {
        path: root.clone(),
        source,
      })?;
    }

    let workspace = Self {
      srcdir: root.join("srcdir"),
      prefix: root.join("destdir"),
      root,
      shard: shard.clone(),
    };
    for dir in [&workspace.srcdir, &workspace.prefix, &workspace.manifests_dir()] {
      fs::create_dir_all(dir).map_err(|source| WorkspaceError::Create {
        path: dir.to_path_buf(),
        source,
      })?;
    }

    for source in sources {
      debug!(source = %source.spec.describe(), "materializing source");
      source.materialize(&workspace.srcdir)?;
    }

    info!(platform = %shard.platform, path = %workspace.root.display(), "workspace ready");
    Ok(workspace)
  }

  pub fn platform(&self) -> Platform {
    self.shard.platform
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn srcdir(&self) -> &Path {
    &self.srcdir
  }

  pub fn prefix(&self) -> &Path {
    &self.prefix
  }

  pub fn shard(&self) -> &ShardMount {
    &self.shard
  }

  pub fn staging_dir(&self) -> PathBuf {
    self.prefix.join(STAGING_DIR)
  }

  pub fn manifests_dir(&self) -> PathBuf {
    self.prefix.join(MANIFESTS_DIR)
  }

  /// Dependency manifests currently recorded under the prefix.
  ///
  /// Their files belong to other packages and are skipped by the audit.
  pub fn ignore_manifests(&self) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(self.manifests_dir()) else {
      return Vec::new();
    };
    let mut manifests: Vec<PathBuf> = entries
      .filter_map(Result::ok)
      .map(|entry| entry.path())
      .filter(|path| path.extension().is_some_and(|ext| ext == "list"))
      .collect();
    manifests.sort();
    manifests
  }

  /// Drop the dependency staging directory so it is never packaged.
  pub fn remove_staging(&self) -> Result<(), WorkspaceError> {
    let staging = self.staging_dir();
    if staging.exists() {
      fs::remove_dir_all(&staging).map_err(|source| WorkspaceError::Cleanup { path: staging, source })?;
    }
    Ok(())
  }

  /// Remove the manifests directory once it holds no dependency records.
  pub fn remove_empty_manifests_dir(&self) -> Result<(), WorkspaceError> {
    let dir = self.manifests_dir();
    let is_empty = fs::read_dir(&dir).map(|mut e| e.next().is_none()).unwrap_or(false);
    if is_empty {
      fs::remove_dir(&dir).map_err(|source| WorkspaceError::Cleanup { path: dir, source })?;
    }
    Ok(())
  }

  /// Delete the whole tree.
  pub fn destroy(self) -> Result<(), WorkspaceError> {
    debug!(path = %self.root.display(), "destroying workspace");
    if self.root.exists() {
      fs::remove_dir_all(&self.root).map_err(|source| WorkspaceError::Cleanup {
        path: self.root.clone(),
        source,
      })?;
    }
    Ok(())
  }
}
