//! Source acquisition and verification.
//!
//! A recipe declares its sources as [`SourceSpec`]s. The [`SourceResolver`]
//! turns each into a [`ResolvedSource`] once per run: a verified file or bare
//! clone in the shared cache that every platform's workspace materializes
//! from.

pub mod archive;
pub mod git;

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache_lock::{CacheLock, CacheLockError};
use crate::platform::paths;
use crate::util::hash::{ContentHash, HashError};
use crate::util::tarball::{self, ArchiveKind};

pub use archive::{CachedFile, cache_path, fetch_archive};
pub use git::GitError;

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("failed to download {url}: {message}")]
  DownloadError { url: String, message: String },

  #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
  HashMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("git source {url}: {source}")]
  Git {
    url: String,
    #[source]
    source: GitError,
  },

  #[error("local source is not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error(transparent)]
  Lock(#[from] CacheLockError),

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("failed to unpack {path}: {source}")]
  Unpack {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("source resolution task failed: {0}")]
  Task(String),
}

impl SourceError {
  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    SourceError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// A source declaration as written in a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
  /// A downloadable file pinned to its sha256.
  RemoteArchive { url: String, sha256: String },
  /// A git repository; tracks the remote HEAD.
  GitSource { git: String },
  /// A directory on the build host.
  LocalDirectory { path: PathBuf },
}

impl SourceSpec {
  /// Short human-readable label for logs.
  pub fn describe(&self) -> String {
    match self {
      SourceSpec::RemoteArchive { url, .. } => url.clone(),
      SourceSpec::GitSource { git } => format!("git+{}", git),
      SourceSpec::LocalDirectory { path } => path.display().to_string(),
    }
  }
}

/// A source available locally in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
  pub spec: SourceSpec,
  /// Cached file for archives and local directories, bare clone for git.
  pub local_path: PathBuf,
  /// `None` for git sources, which are not pinned.
  pub content_hash: Option<ContentHash>,
  /// Commit HEAD resolved to, for git sources.
  pub commit: Option<String>,
}

impl ResolvedSource {
  /// Place this source into a workspace's source directory.
  ///
  /// Tarballs are unpacked into `srcdir`, other downloads are copied in under
  /// their URL file name. Local directories unpack into `srcdir/<dirname>`
  /// and git sources check out into `srcdir/<repo>`.
  pub fn materialize(&self, srcdir: &Path) -> Result<(), SourceError> {
    std::fs::create_dir_all(srcdir).map_err(|e| SourceError::io(srcdir, e))?;

    match &self.spec {
      SourceSpec::RemoteArchive { url, .. } => {
        if ArchiveKind::detect(&self.local_path).is_some() {
          self.unpack_into(srcdir)
        } else {
          let dest = srcdir.join(archive::url_to_filename(url));
          std::fs::copy(&self.local_path, &dest).map_err(|e| SourceError::io(&dest, e))?;
          Ok(())
        }
      }
      SourceSpec::LocalDirectory { path } => self.unpack_into(&srcdir.join(archive::directory_label(path))),
      SourceSpec::GitSource { git } => {
        let dest = srcdir.join(git::repo_name(git));
        git::checkout(&self.local_path, &dest).map_err(|source| SourceError::Git {
          url: git.clone(),
          source,
        })
      }
    }
  }

  fn unpack_into(&self, dest: &Path) -> Result<(), SourceError> {
    let files = tarball::extract(&self.local_path, dest).map_err(|source| SourceError::Unpack {
      path: self.local_path.clone(),
      source,
    })?;
    debug!(archive = %self.local_path.display(), files = files.len(), "unpacked source");
    Ok(())
  }
}

/// Resolves source declarations against the shared cache.
#[derive(Debug, Clone)]
pub struct SourceResolver {
  downloads_dir: PathBuf,
  git_dir: PathBuf,
  client: reqwest::Client,
}

impl Default for SourceResolver {
  fn default() -> Self {
    Self::new(paths::downloads_dir(), paths::git_dir())
  }
}

impl SourceResolver {
  pub fn new(downloads_dir: PathBuf, git_dir: PathBuf) -> Self {
    Self {
      downloads_dir,
      git_dir,
      client: reqwest::Client::new(),
    }
  }

  pub fn with_client(mut self, client: reqwest::Client) -> Self {
    self.client = client;
    self
  }

  pub fn downloads_dir(&self) -> &Path {
    &self.downloads_dir
  }

  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }

  /// Resolve a single source.
  pub async fn resolve(&self, spec: &SourceSpec) -> Result<ResolvedSource, SourceError> {
    match spec {
      SourceSpec::RemoteArchive { url, sha256 } => {
        let cached = fetch_archive(&self.client, url, sha256, &self.downloads_dir).await?;
        Ok(ResolvedSource {
          spec: spec.clone(),
          local_path: cached.path,
          content_hash: Some(cached.hash),
          commit: None,
        })
      }
      SourceSpec::LocalDirectory { path } => {
        let dir = path.clone();
        let downloads = self.downloads_dir.clone();
        let cached = tokio::task::spawn_blocking(move || archive::archive_directory(&dir, &downloads))
          .await
          .map_err(|e| SourceError::Task(e.to_string()))??;
        Ok(ResolvedSource {
          spec: spec.clone(),
          local_path: cached.path,
          content_hash: Some(cached.hash),
          commit: None,
        })
      }
      SourceSpec::GitSource { git } => {
        let url = git.clone();
        let git_dir = self.git_dir.clone();
        let clone = tokio::task::spawn_blocking(move || {
          let _lock = CacheLock::acquire(&git::bare_clone_path(&git_dir, &url))?;
          git::sync_bare(&url, &git_dir).map_err(|source| SourceError::Git { url, source })
        })
        .await
        .map_err(|e| SourceError::Task(e.to_string()))??;
        info!(url = %git, commit = %clone.commit, "git source resolved at HEAD");
        Ok(ResolvedSource {
          spec: spec.clone(),
          local_path: clone.path,
          content_hash: None,
          commit: Some(clone.commit),
        })
      }
    }
  }

  /// Resolve every distinct source concurrently.
  ///
  /// Duplicate declarations are resolved once. Results come back in
  /// declaration order of their first occurrence; the first failure aborts
  /// the remaining work.
  pub async fn resolve_all(&self, specs: &[SourceSpec]) -> Result<Vec<ResolvedSource>, SourceError> {
    let mut distinct: Vec<SourceSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
      if !distinct.contains(spec) {
        distinct.push(spec.clone());
      }
    }
    info!(sources = distinct.len(), "resolving sources");

    let mut handles: Vec<_> = distinct
      .into_iter()
      .map(|spec| {
        let resolver = self.clone();
        tokio::spawn(async move { resolver.resolve(&spec).await })
      })
      .collect();

    let mut resolved = Vec::with_capacity(handles.len());
    for index in 0..handles.len() {
      let outcome = match (&mut handles[index]).await {
        Ok(outcome) => outcome,
        Err(e) => Err(SourceError::Task(e.to_string())),
      };
      match outcome {
        Ok(source) => resolved.push(source),
        Err(err) => {
          for pending in &handles[index + 1..] {
            pending.abort();
          }
          return Err(err);
        }
      }
    }

    Ok(resolved)
  }
}
