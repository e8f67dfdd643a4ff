//! Remote archive downloads and local directory archiving.
//!
//! Both land in the shared downloads cache. Remote archives are keyed by the
//! expected hash and the URL's file name, local directories by the hash of
//! their deterministic tarball.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::SourceError;
use crate::cache_lock::CacheLock;
use crate::consts::TARBALL_EXTENSION;
use crate::util::hash::{ContentHash, hash_file};
use crate::util::tarball;

/// A verified file in the downloads cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
  pub path: PathBuf,
  pub hash: ContentHash,
}

/// Location of the cache entry for `url` pinned to `sha256`.
pub fn cache_path(downloads_dir: &Path, url: &str, sha256: &str) -> PathBuf {
  let sha = sha256.to_ascii_lowercase();
  let prefix = sha.get(..12).unwrap_or(&sha);
  downloads_dir.join(format!("{}-{}", prefix, url_to_filename(url)))
}

/// Fetch `url` into the downloads cache, verifying it against `expected_sha256`.
///
/// A cached copy is reused when its hash still matches. A cached copy that no
/// longer matches is evicted and reported as [`SourceError::HashMismatch`].
/// Fresh downloads stream into a `.part` file that is only renamed into place
/// once the hash verifies.
pub async fn fetch_archive(
  client: &reqwest::Client,
  url: &str,
  expected_sha256: &str,
  downloads_dir: &Path,
) -> Result<CachedFile, SourceError> {
  fs::create_dir_all(downloads_dir)
    .await
    .map_err(|e| SourceError::io(downloads_dir, e))?;

  let dest = cache_path(downloads_dir, url, expected_sha256);
  let _lock = CacheLock::acquire_async(dest.clone()).await?;

  if fs::try_exists(&dest).await.unwrap_or(false) {
    debug!(path = %dest.display(), "checking cached file");
    let actual = hash_blocking(dest.clone()).await?;
    if actual.matches(expected_sha256) {
      info!(url, path = %dest.display(), "using cached file");
      return Ok(CachedFile { path: dest, hash: actual });
    }

    warn!(url, expected = %expected_sha256, actual = %actual, "cached file hash mismatch, evicting");
    fs::remove_file(&dest).await.map_err(|e| SourceError::io(&dest, e))?;
    return Err(SourceError::HashMismatch {
      url: url.to_string(),
      expected: expected_sha256.to_string(),
      actual: actual.0,
    });
  }

  info!(url, "fetching URL");
  let download_error = |message: String| SourceError::DownloadError {
    url: url.to_string(),
    message,
  };

  let mut response = client
    .get(url)
    .send()
    .await
    .map_err(|e| download_error(e.to_string()))?;

  if !response.status().is_success() {
    return Err(download_error(format!("HTTP {}", response.status())));
  }

  let part = partial_path(&dest);
  let mut file = fs::File::create(&part).await.map_err(|e| SourceError::io(&part, e))?;
  let mut hasher = Sha256::new();
  let mut size = 0usize;

  loop {
    let chunk = match response.chunk().await {
      Ok(Some(chunk)) => chunk,
      Ok(None) => break,
      Err(e) => {
        drop(file);
        let _ = fs::remove_file(&part).await;
        return Err(download_error(e.to_string()));
      }
    };
    hasher.update(&chunk);
    size += chunk.len();
    file.write_all(&chunk).await.map_err(|e| SourceError::io(&part, e))?;
  }
  file.flush().await.map_err(|e| SourceError::io(&part, e))?;
  drop(file);

  let actual = hex::encode(hasher.finalize());
  if !actual.eq_ignore_ascii_case(expected_sha256) {
    let _ = fs::remove_file(&part).await;
    return Err(SourceError::HashMismatch {
      url: url.to_string(),
      expected: expected_sha256.to_string(),
      actual,
    });
  }

  fs::rename(&part, &dest).await.map_err(|e| SourceError::io(&dest, e))?;
  info!(path = %dest.display(), size, "download complete");

  Ok(CachedFile {
    path: dest,
    hash: ContentHash(actual),
  })
}

/// Archive a local directory into the downloads cache and hash the result.
///
/// Identical directory contents always map to the same cache entry.
pub fn archive_directory(dir: &Path, downloads_dir: &Path) -> Result<CachedFile, SourceError> {
  if !dir.is_dir() {
    return Err(SourceError::NotADirectory(dir.to_path_buf()));
  }
  std::fs::create_dir_all(downloads_dir).map_err(|e| SourceError::io(downloads_dir, e))?;

  let staged = tempfile::NamedTempFile::new_in(downloads_dir).map_err(|e| SourceError::io(downloads_dir, e))?;
  tarball::create_tar_gz(dir, staged.as_file()).map_err(|e| SourceError::io(dir, e))?;

  let hash = hash_file(staged.path())?;
  let dest = downloads_dir.join(format!(
    "{}-{}.{}",
    &hash.as_str()[..12],
    directory_label(dir),
    TARBALL_EXTENSION
  ));

  staged
    .persist(&dest)
    .map_err(|e| SourceError::io(&dest, e.error))?;
  debug!(dir = %dir.display(), path = %dest.display(), hash = %hash, "archived local directory");

  Ok(CachedFile { path: dest, hash })
}

/// Final path component of `dir`, used to label its cache entry.
pub(crate) fn directory_label(dir: &Path) -> String {
  dir
    .file_name()
    .map(|n| sanitize(&n.to_string_lossy()))
    .filter(|n| !n.is_empty())
    .unwrap_or_else(|| "source".to_string())
}

fn partial_path(dest: &Path) -> PathBuf {
  let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
  name.push(".part");
  dest.with_file_name(name)
}

async fn hash_blocking(path: PathBuf) -> Result<ContentHash, SourceError> {
  tokio::task::spawn_blocking(move || hash_file(&path))
    .await
    .map_err(|e| SourceError::Task(e.to_string()))?
    .map_err(SourceError::from)
}

fn sanitize(name: &str) -> String {
  name
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect()
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of
/// the URL if no suitable filename can be extracted.
pub(crate) fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split('?').next().unwrap_or(filename);
    let sanitized = sanitize(filename);

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  format!("download_{}", &hex::encode(hasher.finalize())[..16])
}
