//! Build-time dependencies.
//!
//! A dependency is another package's published manifest. Its tarball for the
//! target platform is installed into the prefix before the build and purged
//! after it, so only this package's own files are packaged.

pub mod install;
pub mod purge;

use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::manifest::{ArtifactRecord, BuildManifest, ManifestError};
use crate::platform::Platform;

pub use install::{DependencyInstaller, InstallError};
pub use purge::{PurgeError, purge};

/// Everything needed to fetch and verify a dependency's tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDescriptor {
  pub name: String,
  pub platform: Platform,
  pub url: String,
  pub artifact: ArtifactRecord,
}

/// A package whose binaries a build needs.
///
/// [`descriptor`](Self::descriptor) is pure: it never downloads or installs,
/// so the purge step can call it again to find out what the install wrote.
pub trait Dependency: Send + Sync + Debug {
  fn name(&self) -> &str;

  fn descriptor(&self, platform: &Platform) -> Result<DependencyDescriptor, ManifestError>;
}

/// A dependency described by its `build.json`.
#[derive(Debug, Clone)]
pub struct ManifestDependency {
  name: String,
  manifest: BuildManifest,
}

impl ManifestDependency {
  pub fn new(name: impl Into<String>, manifest: BuildManifest) -> Self {
    Self {
      name: name.into(),
      manifest,
    }
  }

  pub fn load(name: impl Into<String>, path: &Path) -> Result<Self, ManifestError> {
    Ok(Self::new(name, BuildManifest::load(path)?))
  }
}

impl Dependency for ManifestDependency {
  fn name(&self) -> &str {
    &self.name
  }

  fn descriptor(&self, platform: &Platform) -> Result<DependencyDescriptor, ManifestError> {
    let artifact = self.manifest.artifact_for(platform)?.clone();
    Ok(DependencyDescriptor {
      name: self.name.clone(),
      platform: *platform,
      url: self.manifest.download_url(platform)?,
      artifact,
    })
  }
}

/// The files one dependency installed into a prefix, relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyManifest {
  pub dependency: String,
  pub files: Vec<PathBuf>,
}

impl DependencyManifest {
  /// `{manifests_dir}/{dependency}.list`
  pub fn record_path(manifests_dir: &Path, dependency: &str) -> PathBuf {
    manifests_dir.join(format!("{dependency}.list"))
  }

  /// Write one path per line.
  pub fn save(&self, manifests_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(manifests_dir)?;
    let path = Self::record_path(manifests_dir, &self.dependency);
    let mut content = String::new();
    for file in &self.files {
      content.push_str(&file.to_string_lossy());
      content.push('\n');
    }
    fs::write(&path, content)?;
    Ok(path)
  }

  pub fn load(manifests_dir: &Path, dependency: &str) -> io::Result<Self> {
    let content = fs::read_to_string(Self::record_path(manifests_dir, dependency))?;
    let mut files: Vec<PathBuf> = content.lines().filter(|l| !l.is_empty()).map(PathBuf::from).collect();
    files.sort();
    Ok(Self {
      dependency: dependency.to_string(),
      files,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn descriptor_comes_from_manifest() {
    let platform: Platform = "x86_64-linux-gnu".parse().unwrap();
    let mut manifest = BuildManifest::new("zlib", "1.3.1", vec![], "https://example.com/zlib");
    manifest.insert(
      platform,
      ArtifactRecord {
        file_name: "zlib.v1.3.1.x86_64-linux-gnu.tar.gz".to_string(),
        sha256: "cd".repeat(32),
      },
    );
    let dep = ManifestDependency::new("zlib", manifest);

    let descriptor = dep.descriptor(&platform).unwrap();
    assert_eq!(descriptor.url, "https://example.com/zlib/zlib.v1.3.1.x86_64-linux-gnu.tar.gz");

    let other: Platform = "aarch64-linux-gnu".parse().unwrap();
    assert!(matches!(
      dep.descriptor(&other),
      Err(ManifestError::PlatformNotAvailable { .. })
    ));
  }

  #[test]
  fn dependency_manifest_persists_as_lines() {
    let temp = TempDir::new().unwrap();
    let record = DependencyManifest {
      dependency: "zlib".to_string(),
      files: vec![PathBuf::from("include/zlib.h"), PathBuf::from("lib/libz.so")],
    };
    let path = record.save(temp.path()).unwrap();

    assert_eq!(path, temp.path().join("zlib.list"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "include/zlib.h\nlib/libz.so\n");
    assert_eq!(DependencyManifest::load(temp.path(), "zlib").unwrap(), record);
  }
}
