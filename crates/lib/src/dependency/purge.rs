use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::{Dependency, DependencyManifest};
use crate::consts::{MANIFESTS_DIR, STAGING_DIR};
use crate::platform::Platform;
use crate::util::hash::hash_file;
use crate::util::tarball;

#[derive(Debug, Error)]
pub enum PurgeError {
  #[error("cannot resolve the files {dependency} installed: {reason}")]
  ManifestResolutionError { dependency: String, reason: String },

  #[error("failed to remove {path}: {source}")]
  Remove {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Remove every file the dependencies installed into `prefix`.
///
/// Each dependency's file list is derived again from its descriptor and the
/// staged tarball and checked against the list recorded at install time.
/// Nothing is deleted unless every dependency resolves. Returns the number
/// of files removed.
pub fn purge(prefix: &Path, platform: &Platform, dependencies: &[Arc<dyn Dependency>]) -> Result<usize, PurgeError> {
  let manifests_dir = prefix.join(MANIFESTS_DIR);
  let resolved = dependencies
    .iter()
    .map(|dep| resolve(prefix, &manifests_dir, platform, dep.as_ref()))
    .collect::<Result<Vec<_>, _>>()?;

  let mut removed = 0;
  let mut parents = BTreeSet::new();
  for record in &resolved {
    for file in &record.files {
      let path = prefix.join(file);
      match fs::symlink_metadata(&path) {
        Ok(_) => {
          fs::remove_file(&path).map_err(|source| PurgeError::Remove {
            path: path.clone(),
            source,
          })?;
          removed += 1;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
          debug!(dependency = %record.dependency, path = %file.display(), "already removed");
        }
        Err(source) => return Err(PurgeError::Remove { path, source }),
      }
      if let Some(parent) = file.parent() {
        parents.insert(parent.to_path_buf());
      }
    }

    let list = DependencyManifest::record_path(&manifests_dir, &record.dependency);
    fs::remove_file(&list).map_err(|source| PurgeError::Remove { path: list, source })?;
    info!(dependency = %record.dependency, files = record.files.len(), "purged dependency");
  }

  prune_empty_dirs(prefix, &parents);
  Ok(removed)
}

fn resolve(
  prefix: &Path,
  manifests_dir: &Path,
  platform: &Platform,
  dependency: &dyn Dependency,
) -> Result<DependencyManifest, PurgeError> {
  let name = dependency.name();
  let unresolved = |reason: String| PurgeError::ManifestResolutionError {
    dependency: name.to_string(),
    reason,
  };

  let descriptor = dependency.descriptor(platform).map_err(|e| unresolved(e.to_string()))?;
  let staged = prefix.join(STAGING_DIR).join(&descriptor.artifact.file_name);
  if !staged.is_file() {
    return Err(unresolved(format!("staged tarball {} is missing", staged.display())));
  }

  let hash = hash_file(&staged).map_err(|e| unresolved(e.to_string()))?;
  if !hash.matches(&descriptor.artifact.sha256) {
    return Err(unresolved(format!(
      "staged tarball hash {} does not match {}",
      hash, descriptor.artifact.sha256
    )));
  }

  let derived = tarball::list_files(&staged).map_err(|e| unresolved(e.to_string()))?;
  let recorded = DependencyManifest::load(manifests_dir, name)
    .map_err(|e| unresolved(format!("no install record: {e}")))?;
  if recorded.files != derived {
    return Err(unresolved("install record disagrees with the tarball contents".to_string()));
  }

  Ok(recorded)
}

/// Remove directories left empty by the purge, deepest first, never
/// touching `prefix` itself.
fn prune_empty_dirs(prefix: &Path, parents: &BTreeSet<PathBuf>) {
  let mut candidates = BTreeSet::new();
  for dir in parents {
    let mut current = Some(dir.as_path());
    while let Some(rel) = current.filter(|p| !p.as_os_str().is_empty()) {
      candidates.insert(rel.to_path_buf());
      current = rel.parent();
    }
  }

  let mut ordered: Vec<PathBuf> = candidates.into_iter().collect();
  ordered.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
  for rel in ordered {
    let dir = prefix.join(&rel);
    let empty = fs::read_dir(&dir).map(|mut e| e.next().is_none()).unwrap_or(false);
    if empty && fs::remove_dir(&dir).is_ok() {
      debug!(dir = %rel.display(), "pruned empty directory");
    }
  }
}
