//! Mount primitives for platform root images.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use super::ShardError;
use crate::platform::Platform;

/// Fallback when `/dev` cannot be inspected.
const DEFAULT_LOOP_SLOTS: usize = 8;

/// Mounts and unmounts the sandbox root for a platform.
pub trait ShardMounter: Send + Sync {
  /// Make the root for `platform` available and return where it lives.
  fn mount(&self, platform: &Platform) -> Result<PathBuf, ShardError>;

  /// Undo a previous [`mount`](Self::mount) of `root`.
  fn unmount(&self, root: &Path) -> Result<(), ShardError>;
}

/// Platform roots that already exist as plain directories: `<root>/<triplet>`.
///
/// Mounting is a lookup and unmounting is a no-op, so this is what hosts
/// without loop devices (and tests) use.
#[derive(Debug, Clone)]
pub struct DirectoryMounter {
  root: PathBuf,
  create_missing: bool,
}

impl DirectoryMounter {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      create_missing: false,
    }
  }

  /// Create an empty root instead of failing when a platform has none.
  pub fn create_missing(mut self, create: bool) -> Self {
    self.create_missing = create;
    self
  }
}

impl ShardMounter for DirectoryMounter {
  fn mount(&self, platform: &Platform) -> Result<PathBuf, ShardError> {
    let path = self.root.join(platform.triplet());
    if !path.is_dir() {
      if !self.create_missing {
        return Err(ShardError::MissingRoot {
          platform: *platform,
          path,
        });
      }
      fs::create_dir_all(&path).map_err(|e| ShardError::Mount {
        platform: *platform,
        message: e.to_string(),
      })?;
    }
    debug!(platform = %platform, root = %path.display(), "using shard directory");
    Ok(path)
  }

  fn unmount(&self, _root: &Path) -> Result<(), ShardError> {
    Ok(())
  }
}

/// Loopback mounts of `<images>/<triplet>.squashfs` with a writable overlay.
///
/// Each platform gets its own directory under `mount_root`:
///
/// ```text
/// <mount_root>/<triplet>/lower   read-only loop mount of the image
/// <mount_root>/<triplet>/upper   overlay upper layer, emptied on every mount
/// <mount_root>/<triplet>/work    overlayfs work directory
/// <mount_root>/<triplet>/root    merged view handed to the sandbox
/// ```
///
/// Writes a build makes into the root land in `upper` and are thrown away on
/// unmount; the image itself is never modified.
#[derive(Debug, Clone)]
pub struct LoopbackMounter {
  images: PathBuf,
  mount_root: PathBuf,
}

/// Directories making up one overlay-mounted shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
  pub lower: PathBuf,
  pub upper: PathBuf,
  pub work: PathBuf,
  pub merged: PathBuf,
}

impl OverlayLayout {
  fn under(dir: &Path) -> Self {
    Self {
      lower: dir.join("lower"),
      upper: dir.join("upper"),
      work: dir.join("work"),
      merged: dir.join("root"),
    }
  }

  /// Recover the layout from the merged root returned by a mount.
  fn of_root(root: &Path) -> Self {
    Self::under(root.parent().unwrap_or(root))
  }

  /// The `-o` argument for `mount -t overlay`.
  pub fn mount_options(&self) -> String {
    format!(
      "lowerdir={},upperdir={},workdir={}",
      self.lower.display(),
      self.upper.display(),
      self.work.display()
    )
  }
}

impl LoopbackMounter {
  pub fn new(images: impl Into<PathBuf>, mount_root: impl Into<PathBuf>) -> Self {
    Self {
      images: images.into(),
      mount_root: mount_root.into(),
    }
  }

  pub fn image_path(&self, platform: &Platform) -> PathBuf {
    self.images.join(format!("{}.squashfs", platform.triplet()))
  }

  pub fn layout(&self, platform: &Platform) -> OverlayLayout {
    OverlayLayout::under(&self.mount_root.join(platform.triplet()))
  }
}

impl ShardMounter for LoopbackMounter {
  fn mount(&self, platform: &Platform) -> Result<PathBuf, ShardError> {
    let image = self.image_path(platform);
    if !image.is_file() {
      return Err(ShardError::MissingRoot {
        platform: *platform,
        path: image,
      });
    }

    let layout = self.layout(platform);
    let mount_error = |message: String| ShardError::Mount {
      platform: *platform,
      message,
    };
    for scratch in [&layout.upper, &layout.work] {
      if scratch.exists() {
        fs::remove_dir_all(scratch).map_err(|e| mount_error(e.to_string()))?;
      }
    }
    for dir in [&layout.lower, &layout.upper, &layout.work, &layout.merged] {
      fs::create_dir_all(dir).map_err(|e| mount_error(e.to_string()))?;
    }

    info!(platform = %platform, image = %image.display(), "mounting shard");
    run(Command::new("mount").args(["-o", "loop,ro"]).arg(&image).arg(&layout.lower)).map_err(mount_error)?;

    let overlay = run(
      Command::new("mount")
        .args(["-t", "overlay", "overlay", "-o"])
        .arg(layout.mount_options())
        .arg(&layout.merged),
    );
    if let Err(message) = overlay {
      if let Err(e) = run(Command::new("umount").arg(&layout.lower)) {
        warn!(lower = %layout.lower.display(), error = %e, "failed to unmount image after overlay error");
      }
      return Err(mount_error(message));
    }

    debug!(platform = %platform, root = %layout.merged.display(), "overlay mounted");
    Ok(layout.merged)
  }

  fn unmount(&self, root: &Path) -> Result<(), ShardError> {
    debug!(root = %root.display(), "unmounting shard");
    let layout = OverlayLayout::of_root(root);
    for target in [&layout.merged, &layout.lower] {
      run(Command::new("umount").arg(target)).map_err(|message| ShardError::Unmount {
        path: target.clone(),
        message,
      })?;
    }
    for scratch in [&layout.upper, &layout.work] {
      if let Err(e) = fs::remove_dir_all(scratch) {
        debug!(path = %scratch.display(), error = %e, "could not clear overlay layer");
      }
    }
    Ok(())
  }
}

fn run(command: &mut Command) -> Result<(), String> {
  let output = command.output().map_err(|e| e.to_string())?;
  if output.status.success() {
    Ok(())
  } else {
    Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
  }
}

/// Number of loop devices the host exposes, used as the default mount budget.
pub fn available_loop_slots() -> usize {
  count_loop_devices(Path::new("/dev")).unwrap_or(DEFAULT_LOOP_SLOTS)
}

fn count_loop_devices(dev: &Path) -> Option<usize> {
  let count = fs::read_dir(dev)
    .ok()?
    .filter_map(Result::ok)
    .filter(|entry| {
      let name = entry.file_name();
      let name = name.to_string_lossy();
      name
        .strip_prefix("loop")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
    .count();
  (count > 0).then_some(count)
}
