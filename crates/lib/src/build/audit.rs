//! Post-build audit of the prefix.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::{MANIFESTS_DIR, STAGING_DIR};

#[derive(Debug, Error)]
pub enum AuditError {
  #[error("audit rejected {path}: {reason}")]
  Rejected { path: PathBuf, reason: String },

  #[error("failed to read {path} during audit: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Inspects (and may patch) the binaries a build produced.
pub trait Auditor: Send + Sync {
  /// `ignore_manifests` name the dependency records whose files are not
  /// this package's and must be left alone.
  fn audit(&self, prefix: &Path, ignore_manifests: &[PathBuf]) -> Result<(), AuditError>;
}

/// Logs what would be audited and changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipAudit;

impl Auditor for SkipAudit {
  fn audit(&self, prefix: &Path, ignore_manifests: &[PathBuf]) -> Result<(), AuditError> {
    let files = auditable_files(prefix, ignore_manifests)?;
    for file in &files {
      debug!(path = %file.display(), "would audit");
    }
    info!(files = files.len(), ignored = ignore_manifests.len(), "audit skipped");
    Ok(())
  }
}

/// Files under `prefix` that belong to the package being built, relative
/// to the prefix and sorted.
pub fn auditable_files(prefix: &Path, ignore_manifests: &[PathBuf]) -> Result<Vec<PathBuf>, AuditError> {
  let mut ignored = BTreeSet::new();
  for manifest in ignore_manifests {
    let content = fs::read_to_string(manifest).map_err(|source| AuditError::Io {
      path: manifest.clone(),
      source,
    })?;
    ignored.extend(content.lines().filter(|l| !l.is_empty()).map(PathBuf::from));
  }

  let mut files = Vec::new();
  let walker = WalkDir::new(prefix)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|entry| {
      entry.depth() != 1 || (entry.file_name() != STAGING_DIR && entry.file_name() != MANIFESTS_DIR)
    });
  for entry in walker {
    let entry = entry.map_err(|e| AuditError::Io {
      path: prefix.to_path_buf(),
      source: e.into(),
    })?;
    if entry.file_type().is_dir() {
      continue;
    }
    let rel = entry.path().strip_prefix(prefix).unwrap_or(entry.path()).to_path_buf();
    if !ignored.contains(&rel) {
      files.push(rel);
    }
  }
  Ok(files)
}
