//! Git sources.
//!
//! Every git URL is mirrored into a bare clone under the cache's `git/`
//! directory. Later runs fetch into the existing clone instead of cloning
//! again. Builds check out a working tree from the bare clone, never from the
//! network.

use std::fs;
use std::path::{Path, PathBuf};

use gix::refs::transaction::PreviousValue;
use gix::remote::Direction;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur during git operations.
#[derive(Debug, Error)]
pub enum GitError {
  #[error("failed to create cache directory '{0}': {1}")]
  CreateCacheDir(PathBuf, #[source] std::io::Error),

  #[error("failed to clone repository '{url}': {source}")]
  Clone {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to open repository at '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: Box<gix::open::Error>,
  },

  #[error("failed to fetch from '{url}': {source}")]
  Fetch {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to check out '{path}': {source}")]
  Checkout {
    path: PathBuf,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to resolve HEAD: {0}")]
  ResolveHead(String),

  #[error("no remote configured for repository")]
  NoRemote,
}

/// A bare clone in the cache and the commit its HEAD pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareClone {
  pub path: PathBuf,
  pub commit: String,
}

/// Directory of the bare clone for `url` under `git_dir`.
pub fn bare_clone_path(git_dir: &Path, url: &str) -> PathBuf {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  let digest = hex::encode(hasher.finalize());
  git_dir.join(format!("{}-{}.git", repo_name(url), &digest[..12]))
}

/// Name of the repository as it appears at the end of `url`, without `.git`.
///
/// The result is always a single path component; URLs ending in `.` or `..`
/// get the generic name `repo`.
pub fn repo_name(url: &str) -> String {
  let last = url.trim_end_matches(['/', '\\']).rsplit(['/', '\\', ':']).next().unwrap_or(url);
  let name = last.strip_suffix(".git").unwrap_or(last);
  match name {
    "" | "." | ".." => "repo".to_string(),
    name => name.to_string(),
  }
}

/// Clone `url` bare into the cache, or fetch updates into an existing clone.
///
/// Returns the clone and the commit HEAD resolves to. Nothing is pinned: the
/// next run may see a different commit.
pub fn sync_bare(url: &str, git_dir: &Path) -> Result<BareClone, GitError> {
  if !git_dir.exists() {
    fs::create_dir_all(git_dir).map_err(|e| GitError::CreateCacheDir(git_dir.to_path_buf(), e))?;
  }

  let path = bare_clone_path(git_dir, url);
  let repo = if path.join("HEAD").exists() {
    debug!(url, path = %path.display(), "opening existing bare clone");
    let repo = gix::open(&path).map_err(|e| GitError::Open {
      path: path.clone(),
      source: Box::new(e),
    })?;
    fetch_updates(&repo, url)?;
    repo
  } else {
    info!(url, path = %path.display(), "cloning repository");
    clone_bare(url, &path)?
  };

  let commit = head_commit(&repo)?;
  debug!(url, commit = %commit, "resolved HEAD");
  Ok(BareClone { path, commit })
}

/// Check out a working tree of the bare clone at `dest`.
pub fn checkout(bare: &Path, dest: &Path) -> Result<(), GitError> {
  let source = bare.to_string_lossy().into_owned();
  let mut prepared = gix::prepare_clone(source.as_str(), dest).map_err(|e| GitError::Clone {
    url: source.clone(),
    source: Box::new(e),
  })?;

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Clone {
      url: source.clone(),
      source: Box::new(e),
    })?;

  checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Checkout {
      path: dest.to_path_buf(),
      source: Box::new(e),
    })?;

  Ok(())
}

fn clone_bare(url: &str, dest: &Path) -> Result<gix::Repository, GitError> {
  let mut prepared = gix::prepare_clone_bare(url, dest).map_err(|e| GitError::Clone {
    url: url.to_string(),
    source: Box::new(e),
  })?;

  let (repo, _outcome) = prepared
    .fetch_only(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Clone {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  Ok(repo)
}

fn fetch_updates(repo: &gix::Repository, url: &str) -> Result<(), GitError> {
  debug!(url, "fetching updates");

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or(GitError::NoRemote)?
    .map_err(|e| GitError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?;
  let remote_name = remote
    .name()
    .map(|name| name.as_bstr().to_string())
    .unwrap_or_else(|| "origin".to_string());

  let connection = remote.connect(Direction::Fetch).map_err(|e| GitError::Fetch {
    url: url.to_string(),
    source: Box::new(e),
  })?;

  connection
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| GitError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  advance_head(repo, &remote_name, url)
}

/// Move the branch HEAD points at to its freshly fetched remote-tracking ref.
///
/// Fetching only writes `refs/remotes/<remote>/*`; the local branch keeps the
/// commit from the first clone until it is updated here.
fn advance_head(repo: &gix::Repository, remote_name: &str, url: &str) -> Result<(), GitError> {
  let Some(branch) = repo.head_name().map_err(|e| GitError::ResolveHead(e.to_string()))? else {
    return Ok(());
  };
  let tracking = format!("refs/remotes/{remote_name}/{}", branch.shorten());
  let Some(mut tracked) = repo
    .try_find_reference(tracking.as_str())
    .map_err(|e| GitError::ResolveHead(e.to_string()))?
  else {
    debug!(url, %tracking, "no remote-tracking ref for HEAD");
    return Ok(());
  };
  let target = tracked
    .peel_to_id()
    .map_err(|e| GitError::ResolveHead(e.to_string()))?
    .detach();

  let branch = branch.as_bstr().to_string();
  repo
    .reference(branch.as_str(), target, PreviousValue::Any, format!("fetch: update from {url}"))
    .map_err(|e| GitError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?;
  debug!(url, %branch, commit = %target, "advanced local branch");
  Ok(())
}

fn head_commit(repo: &gix::Repository) -> Result<String, GitError> {
  let mut head = repo.head().map_err(|e| GitError::ResolveHead(e.to_string()))?;
  let commit = head
    .peel_to_commit()
    .map_err(|e| GitError::ResolveHead(e.to_string()))?;
  Ok(commit.id.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::GitUpstream;
  use tempfile::TempDir;

  #[test]
  fn first_sync_clones_upstream_head() {
    let temp = TempDir::new().unwrap();
    let upstream = GitUpstream::init(&temp.path().join("upstream"));
    let first = upstream.commit_version("1\n");

    let clone = sync_bare(&upstream.url, &temp.path().join("cache")).unwrap();
    assert_eq!(clone.commit, first);
    assert!(clone.path.join("HEAD").exists());
  }

  #[test]
  fn later_sync_follows_new_upstream_commits() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let upstream = GitUpstream::init(&temp.path().join("upstream"));
    upstream.commit_version("1\n");
    let before = sync_bare(&upstream.url, &cache).unwrap();

    let second = upstream.commit_version("2\n");
    let after = sync_bare(&upstream.url, &cache).unwrap();
    assert_eq!(after.path, before.path);
    assert_eq!(after.commit, second);

    let tree = temp.path().join("checkout");
    checkout(&after.path, &tree).unwrap();
    assert_eq!(fs::read_to_string(tree.join("VERSION")).unwrap(), "2\n");
  }

  #[test]
  fn checkout_writes_working_tree() {
    let temp = TempDir::new().unwrap();
    let upstream = GitUpstream::init(&temp.path().join("upstream"));
    upstream.commit_version("1.0\n");
    let clone = sync_bare(&upstream.url, &temp.path().join("cache")).unwrap();

    let tree = temp.path().join("src/upstream");
    checkout(&clone.path, &tree).unwrap();
    assert_eq!(fs::read_to_string(tree.join("VERSION")).unwrap(), "1.0\n");
  }

  #[test]
  fn repo_name_is_single_component() {
    assert_eq!(repo_name("https://example.com/.."), "repo");
    assert_eq!(repo_name("https://example.com/./"), "repo");
    assert_eq!(repo_name("C:\\src\\helper.git"), "helper");
    assert_eq!(repo_name(""), "repo");
  }

  #[test]
  fn repo_name_strips_suffix() {
    assert_eq!(repo_name("https://github.com/org/helper.git"), "helper");
    assert_eq!(repo_name("https://github.com/org/helper/"), "helper");
    assert_eq!(repo_name("git@github.com:org/helper.git"), "helper");
  }

  #[test]
  fn bare_clone_path_distinguishes_urls() {
    let a = bare_clone_path(Path::new("/cache/git"), "https://github.com/a/helper.git");
    let b = bare_clone_path(Path::new("/cache/git"), "https://github.com/b/helper.git");
    assert_ne!(a, b);
    assert!(a.file_name().unwrap().to_string_lossy().starts_with("helper-"));
    assert!(a.extension().is_some_and(|ext| ext == "git"));
  }

  #[test]
  fn bare_clone_path_is_stable() {
    let url = "https://github.com/org/helper.git";
    assert_eq!(
      bare_clone_path(Path::new("/c"), url),
      bare_clone_path(Path::new("/c"), url)
    );
  }
}
