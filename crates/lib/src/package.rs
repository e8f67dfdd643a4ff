//! Packaging a finished prefix into a content-hashed tarball.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::consts::TARBALL_EXTENSION;
use crate::manifest::ArtifactRecord;
use crate::platform::Platform;
use crate::util::hash::{HashError, hash_file};
use crate::util::tarball;

#[derive(Debug, Error)]
pub enum PackageError {
  #[error("failed to archive {prefix}: {source}")]
  Archive {
    prefix: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// `{base}.v{version}.{triplet}.tar.gz`
pub fn tarball_name(base: &str, version: &str, platform: &Platform) -> String {
  format!("{}.v{}.{}.{}", base, version, platform.triplet(), TARBALL_EXTENSION)
}

/// Archive `prefix` next to `output_base` and hash the result.
///
/// `output_base` is a path whose file name is the package base name, e.g.
/// `products/libfoo`. Any tarball left at the target path by an earlier run
/// is replaced.
pub fn package(
  prefix: &Path,
  output_base: &Path,
  version: &str,
  platform: &Platform,
) -> Result<ArtifactRecord, PackageError> {
  let base = output_base
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  let out_dir = output_base.parent().unwrap_or(Path::new("."));
  let file_name = tarball_name(&base, version, platform);
  let dest = out_dir.join(&file_name);

  let write_error = |source: io::Error| PackageError::Write {
    path: dest.clone(),
    source,
  };
  fs::create_dir_all(out_dir).map_err(write_error)?;

  let staged = tempfile::NamedTempFile::new_in(out_dir).map_err(write_error)?;
  let mut file = tarball::create_tar_gz(prefix, staged.as_file()).map_err(|source| PackageError::Archive {
    prefix: prefix.to_path_buf(),
    source,
  })?;
  file.flush().map_err(write_error)?;
  staged.persist(&dest).map_err(|e| write_error(e.error))?;

  let hash = hash_file(&dest)?;
  info!(platform = %platform, tarball = %file_name, sha256 = %hash, "packaged");

  Ok(ArtifactRecord {
    file_name,
    sha256: hash.0,
  })
}
