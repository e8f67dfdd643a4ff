//! File-based locking of individual downloads-cache entries.
//!
//! Every cache entry `X` is guarded by `X.lock`. Holding the exclusive lock
//! means no other task or process is downloading, verifying, or archiving the
//! same entry; distinct entries lock independently, so unrelated sources still
//! resolve in parallel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub entry: String,
}

#[derive(Debug, Error)]
pub enum CacheLockError {
  #[error("failed to create cache directory {0}: {1}")]
  CreateDir(PathBuf, #[source] io::Error),

  #[error("failed to open lock file {0}: {1}")]
  OpenFile(PathBuf, #[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock {0}: {1}")]
  LockFailed(PathBuf, #[source] io::Error),

  #[error("lock task panicked: {0}")]
  Join(String),
}

/// An exclusive lock on one cache entry, released on drop.
pub struct CacheLock {
  file: File,
  lock_path: PathBuf,
}

impl CacheLock {
  /// Path of the lock file guarding `entry`.
  pub fn lock_path_for(entry: &Path) -> PathBuf {
    let mut name = entry.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    entry.with_file_name(name)
  }

  /// Block until the exclusive lock on `entry` is held.
  pub fn acquire(entry: &Path) -> Result<Self, CacheLockError> {
    let lock_path = Self::lock_path_for(entry);

    if let Some(parent) = lock_path.parent()
      && !parent.exists()
    {
      std::fs::create_dir_all(parent).map_err(|e| CacheLockError::CreateDir(parent.to_path_buf(), e))?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|e| CacheLockError::OpenFile(lock_path.clone(), e))?;

    match try_lock(&file) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        match Self::read_holder(&lock_path) {
          Some(holder) => info!(
            entry = %holder.entry,
            pid = holder.pid,
            "waiting for another resolver to finish with cache entry"
          ),
          None => info!(path = %lock_path.display(), "waiting for cache entry lock"),
        }
        lock_blocking(&file).map_err(|e| CacheLockError::LockFailed(lock_path.clone(), e))?;
      }
      Err(err) => return Err(CacheLockError::LockFailed(lock_path, err)),
    }

    Self::write_metadata(&file, entry)?;
    debug!(path = %lock_path.display(), "cache entry locked");

    Ok(CacheLock { file, lock_path })
  }

  /// Acquire from async code without stalling the runtime.
  pub async fn acquire_async(entry: PathBuf) -> Result<Self, CacheLockError> {
    tokio::task::spawn_blocking(move || Self::acquire(&entry))
      .await
      .map_err(|e| CacheLockError::Join(e.to_string()))?
  }

  /// Reads the lock metadata from the held file handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  fn write_metadata(file: &File, entry: &Path) -> Result<(), CacheLockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      entry: entry.display().to_string(),
    };

    file.set_len(0).map_err(CacheLockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, &metadata).map_err(|e| CacheLockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(CacheLockError::WriteMetadata)?;

    Ok(())
  }

  fn read_holder(lock_path: &Path) -> Option<LockMetadata> {
    let mut contents = String::new();
    File::open(lock_path).ok()?.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
  }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(unix)]
fn lock_blocking(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::LockExclusive).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

// Builds only run on unix hosts; elsewhere the lock degrades to a marker file.
#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
  Ok(())
}

#[cfg(not(unix))]
fn lock_blocking(_file: &File) -> io::Result<()> {
  Ok(())
}
