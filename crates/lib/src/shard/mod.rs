//! Bounded pool of mounted platform root images ("shards").
//!
//! Every [`ShardHandle`] handed out by [`ShardPool::acquire`] is released
//! exactly once: explicitly, by [`ShardPool::release_all`], or when the
//! handle is dropped. The number of live mounts never exceeds the pool's
//! budget.

pub mod mounter;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

pub use mounter::{DirectoryMounter, LoopbackMounter, OverlayLayout, ShardMounter, available_loop_slots};

use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum ShardError {
  #[error("cannot mount shard for {platform}: all {max} mount slots are in use")]
  ResourceExhausted { platform: Platform, max: usize },

  #[error("no shard root for {platform} at {path}")]
  MissingRoot { platform: Platform, path: PathBuf },

  #[error("failed to mount shard for {platform}: {message}")]
  Mount { platform: Platform, message: String },

  #[error("failed to unmount {path}: {message}")]
  Unmount { path: PathBuf, message: String },
}

/// What a build sees of a mounted shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMount {
  pub platform: Platform,
  pub root: PathBuf,
}

struct Mounted {
  platform: Platform,
  root: PathBuf,
}

struct PoolInner {
  mounter: Box<dyn ShardMounter>,
  max_mounts: usize,
  mounted: Mutex<BTreeMap<u64, Mounted>>,
  next_id: AtomicU64,
}

impl PoolInner {
  fn mounted(&self) -> MutexGuard<'_, BTreeMap<u64, Mounted>> {
    self.mounted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Unmount `id` if it is still live. Releasing twice is a no-op.
  fn release(&self, id: u64) -> Result<bool, ShardError> {
    let Some(entry) = self.mounted().remove(&id) else {
      return Ok(false);
    };
    debug!(platform = %entry.platform, root = %entry.root.display(), "releasing shard");
    self.mounter.unmount(&entry.root)?;
    Ok(true)
  }
}

/// A mounted shard, released on drop.
pub struct ShardHandle {
  id: u64,
  mount: ShardMount,
  pool: Arc<PoolInner>,
}

impl ShardHandle {
  pub fn platform(&self) -> Platform {
    self.mount.platform
  }

  pub fn root(&self) -> &Path {
    &self.mount.root
  }

  pub fn mount(&self) -> ShardMount {
    self.mount.clone()
  }

  /// Unmount now and report any failure.
  pub fn release(self) -> Result<(), ShardError> {
    self.pool.release(self.id).map(|_| ())
  }
}

impl Drop for ShardHandle {
  fn drop(&mut self) {
    if let Err(err) = self.pool.release(self.id) {
      warn!(platform = %self.mount.platform, error = %err, "failed to release shard");
    }
  }
}

impl std::fmt::Debug for ShardHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ShardHandle")
      .field("id", &self.id)
      .field("mount", &self.mount)
      .finish()
  }
}

#[derive(Clone)]
pub struct ShardPool {
  inner: Arc<PoolInner>,
}

impl ShardPool {
  pub fn new(mounter: impl ShardMounter + 'static, max_mounts: usize) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        mounter: Box::new(mounter),
        max_mounts,
        mounted: Mutex::new(BTreeMap::new()),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn max_mounts(&self) -> usize {
    self.inner.max_mounts
  }

  pub fn mounted_count(&self) -> usize {
    self.inner.mounted().len()
  }

  /// Mount the shard for `platform`, failing if the budget is spent.
  pub fn acquire(&self, platform: &Platform) -> Result<ShardHandle, ShardError> {
    // Held across the mount so two acquirers cannot both take the last slot.
    let mut mounted = self.inner.mounted();
    if mounted.len() >= self.inner.max_mounts {
      return Err(ShardError::ResourceExhausted {
        platform: *platform,
        max: self.inner.max_mounts,
      });
    }

    let root = self.inner.mounter.mount(platform)?;
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    mounted.insert(
      id,
      Mounted {
        platform: *platform,
        root: root.clone(),
      },
    );
    debug!(platform = %platform, live = mounted.len(), "shard acquired");
    drop(mounted);

    Ok(ShardHandle {
      id,
      mount: ShardMount {
        platform: *platform,
        root,
      },
      pool: Arc::clone(&self.inner),
    })
  }

  pub fn release(&self, handle: ShardHandle) -> Result<(), ShardError> {
    handle.release()
  }

  /// Unmount every outstanding shard. Returns how many were still mounted.
  pub fn release_all(&self) -> usize {
    let drained: Vec<Mounted> = std::mem::take(&mut *self.inner.mounted()).into_values().collect();
    for entry in &drained {
      warn!(platform = %entry.platform, "releasing shard left mounted");
      if let Err(err) = self.inner.mounter.unmount(&entry.root) {
        warn!(platform = %entry.platform, error = %err, "failed to release shard");
      }
    }
    drained.len()
  }

  /// Run `f` with the shard for `platform` mounted, releasing it afterwards
  /// whether `f` succeeds or fails.
  pub async fn scoped<F, Fut, T, E>(&self, platform: &Platform, f: F) -> Result<T, E>
  where
    F: FnOnce(ShardMount) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<ShardError>,
  {
    let handle = self.acquire(platform)?;
    let result = f(handle.mount()).await;
    match (result, handle.release()) {
      (Ok(value), Ok(())) => Ok(value),
      (Ok(_), Err(err)) => Err(err.into()),
      (Err(err), released) => {
        if let Err(release_err) = released {
          warn!(platform = %platform, error = %release_err, "failed to release shard after error");
        }
        Err(err)
      }
    }
  }
}

impl std::fmt::Debug for ShardPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ShardPool")
      .field("max_mounts", &self.inner.max_mounts)
      .field("mounted", &self.mounted_count())
      .finish()
  }
}
