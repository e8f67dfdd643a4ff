//! Run options and release-target discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::build::BuildFlags;
use crate::orchestrator::heartbeat;
use crate::orchestrator::partition::Partition;
use crate::platform::Platform;

pub const REPO_PLACEHOLDER: &str = "<repo>";
pub const TAG_PLACEHOLDER: &str = "<tag>";

/// The GitHub repository and tag whose release hosts the tarballs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTarget {
  /// `owner/name`
  pub repo: String,
  pub tag: String,
}

impl ReleaseTarget {
  pub fn new(repo: impl Into<String>, tag: impl Into<String>) -> Self {
    Self {
      repo: repo.into(),
      tag: tag.into(),
    }
  }

  /// Work out the release target once per run.
  ///
  /// Each of repo and tag is taken from the first source that has it:
  /// explicit configuration, CI environment variables, the git checkout at
  /// `dir`, and finally a placeholder.
  pub fn discover(explicit_repo: Option<&str>, explicit_tag: Option<&str>, dir: &Path) -> Self {
    let git = GitIdentity::inspect(dir);

    let repo = explicit_repo
      .map(str::to_string)
      .or_else(ci_repo)
      .or(git.repo)
      .unwrap_or_else(|| {
        warn!("could not determine release repository, manifest urls will contain a placeholder");
        REPO_PLACEHOLDER.to_string()
      });
    let tag = explicit_tag
      .map(str::to_string)
      .or_else(ci_tag)
      .or(git.tag)
      .unwrap_or_else(|| {
        warn!("could not determine release tag, manifest urls will contain a placeholder");
        TAG_PLACEHOLDER.to_string()
      });

    debug!(repo = %repo, tag = %tag, "release target");
    Self { repo, tag }
  }

  pub fn is_placeholder(&self) -> bool {
    self.repo == REPO_PLACEHOLDER || self.tag == TAG_PLACEHOLDER
  }

  /// Base URL release assets download from.
  pub fn bin_path(&self) -> String {
    format!("https://github.com/{}/releases/download/{}", self.repo, self.tag)
  }
}

fn non_empty_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn ci_repo() -> Option<String> {
  non_empty_var("GITHUB_REPOSITORY").or_else(|| non_empty_var("TRAVIS_REPO_SLUG"))
}

fn ci_tag() -> Option<String> {
  let github = non_empty_var("GITHUB_REF_TYPE")
    .filter(|kind| kind == "tag")
    .and_then(|_| non_empty_var("GITHUB_REF_NAME"));
  github.or_else(|| non_empty_var("TRAVIS_TAG"))
}

#[derive(Debug, Default)]
struct GitIdentity {
  repo: Option<String>,
  tag: Option<String>,
}

impl GitIdentity {
  fn inspect(dir: &Path) -> Self {
    let Ok(repo) = gix::discover(dir) else {
      return Self::default();
    };

    let slug = repo
      .find_remote("origin")
      .ok()
      .and_then(|remote| remote.url(gix::remote::Direction::Fetch).map(|url| url.to_bstring().to_string()))
      .and_then(|url| github_slug(&url));

    Self {
      repo: slug,
      tag: head_tag(&repo),
    }
  }
}

fn head_tag(repo: &gix::Repository) -> Option<String> {
  let head = repo.head_id().ok()?.detach();
  let references = repo.references().ok()?;
  let mut tags: Vec<String> = references
    .tags()
    .ok()?
    .filter_map(Result::ok)
    .filter_map(|reference| {
      let name = reference.name().shorten().to_string();
      let id = reference.into_fully_peeled_id().ok()?.detach();
      (id == head).then_some(name)
    })
    .collect();
  tags.sort();
  tags.pop()
}

/// `owner/name` from a GitHub remote URL in https or scp form.
pub fn github_slug(url: &str) -> Option<String> {
  let trimmed = url.trim_end_matches('/');
  let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
  let path = if let Some((_, rest)) = trimmed.split_once("github.com") {
    rest.trim_start_matches([':', '/'])
  } else {
    return None;
  };
  let mut parts = path.split('/').filter(|p| !p.is_empty());
  let owner = parts.next()?;
  let name = parts.next()?;
  if parts.next().is_some() {
    return None;
  }
  Some(format!("{owner}/{name}"))
}

/// Everything a run needs besides the recipe.
#[derive(Debug, Clone)]
pub struct RunOptions {
  pub build_dir: PathBuf,
  pub output_dir: PathBuf,
  /// Overrides the recipe's platform list.
  pub platforms: Option<Vec<Platform>>,
  pub partition: Option<Partition>,
  pub flags: BuildFlags,
  /// Skip building and rebuild the manifest from the published release.
  pub only_manifest: bool,
  pub release: ReleaseTarget,
  /// Period of the progress line logged in non-interactive runs.
  pub heartbeat: Duration,
}

impl RunOptions {
  pub fn new(release: ReleaseTarget) -> Self {
    Self {
      build_dir: PathBuf::from("build"),
      output_dir: PathBuf::from("products"),
      platforms: None,
      partition: None,
      flags: BuildFlags::default(),
      only_manifest: false,
      release,
      heartbeat: heartbeat::DEFAULT_PERIOD,
    }
  }
}
