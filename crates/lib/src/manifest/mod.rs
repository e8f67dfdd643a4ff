//! The consumer-facing `build.json` document.
//!
//! A [`BuildManifest`] maps every built platform to the tarball that holds
//! its binaries and that tarball's sha256. Downstream packages read it to
//! fetch prebuilt binaries instead of rebuilding.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::build::product::Product;
use crate::consts::MANIFEST_FILENAME;
use crate::platform::Platform;
use crate::util::hash::is_sha256_hex;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("{name} has no build for {platform}")]
  PlatformNotAvailable { name: String, platform: Platform },

  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse manifest {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write manifest {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize manifest: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("download url '{0}' does not name a file")]
  InvalidUrl(String),

  #[error("artifact for {platform}: {reason}")]
  InvalidArtifact { platform: Platform, reason: String },
}

/// One platform's packaged output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
  pub file_name: String,
  pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DownloadInfo {
  url: String,
  sha256: String,
}

/// On-disk shape; artifacts are stored as full download URLs.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
  name: String,
  version: String,
  #[serde(default)]
  products: Vec<Product>,
  bin_path: String,
  #[serde(default)]
  download_info: BTreeMap<Platform, DownloadInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ManifestDocument", try_from = "ManifestDocument")]
pub struct BuildManifest {
  pub name: String,
  pub version: String,
  pub products: Vec<Product>,
  /// Base URL every tarball is downloaded from.
  pub bin_path: String,
  pub artifacts: BTreeMap<Platform, ArtifactRecord>,
}

impl BuildManifest {
  pub fn new(
    name: impl Into<String>,
    version: impl Into<String>,
    products: Vec<Product>,
    bin_path: impl Into<String>,
  ) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      products,
      bin_path: bin_path.into(),
      artifacts: BTreeMap::new(),
    }
  }

  pub fn insert(&mut self, platform: Platform, record: ArtifactRecord) {
    self.artifacts.insert(platform, record);
  }

  pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
    self.artifacts.keys()
  }

  /// The tarball built for `platform`.
  pub fn artifact_for(&self, platform: &Platform) -> Result<&ArtifactRecord, ManifestError> {
    self
      .artifacts
      .get(platform)
      .ok_or_else(|| ManifestError::PlatformNotAvailable {
        name: self.name.clone(),
        platform: *platform,
      })
  }

  /// Where to download the tarball built for `platform`.
  pub fn download_url(&self, platform: &Platform) -> Result<String, ManifestError> {
    let record = self.artifact_for(platform)?;
    Ok(self.url_of(record))
  }

  fn url_of(&self, record: &ArtifactRecord) -> String {
    format!("{}/{}", self.bin_path.trim_end_matches('/'), record.file_name)
  }

  /// Write `build.json` into `dir`, replacing any previous one atomically.
  pub fn write(&self, dir: &Path) -> Result<PathBuf, ManifestError> {
    fs::create_dir_all(dir).map_err(|source| ManifestError::Write {
      path: dir.to_path_buf(),
      source,
    })?;

    let path = dir.join(MANIFEST_FILENAME);
    let temp_path = dir.join(format!("{}.tmp", MANIFEST_FILENAME));

    let mut content = serde_json::to_string_pretty(self).map_err(ManifestError::Serialize)?;
    content.push('\n');
    let write_error = |source| ManifestError::Write {
      path: path.clone(),
      source,
    };
    fs::write(&temp_path, &content).map_err(write_error)?;
    fs::rename(&temp_path, &path).map_err(write_error)?;

    info!(path = %path.display(), platforms = self.artifacts.len(), "wrote manifest");
    Ok(path)
  }

  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }
}

impl From<BuildManifest> for ManifestDocument {
  fn from(manifest: BuildManifest) -> Self {
    let download_info = manifest
      .artifacts
      .iter()
      .map(|(platform, record)| {
        (
          *platform,
          DownloadInfo {
            url: manifest.url_of(record),
            sha256: record.sha256.clone(),
          },
        )
      })
      .collect();

    ManifestDocument {
      name: manifest.name,
      version: manifest.version,
      products: manifest.products,
      bin_path: manifest.bin_path,
      download_info,
    }
  }
}

impl TryFrom<ManifestDocument> for BuildManifest {
  type Error = ManifestError;

  fn try_from(doc: ManifestDocument) -> Result<Self, Self::Error> {
    let mut artifacts = BTreeMap::new();
    for (platform, info) in doc.download_info {
      let file_name = info
        .url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ManifestError::InvalidUrl(info.url.clone()))?
        .to_string();
      if file_name == ".." || file_name == "." || file_name.contains('\\') {
        return Err(ManifestError::InvalidArtifact {
          platform,
          reason: format!("'{file_name}' is not a plain file name"),
        });
      }
      if !is_sha256_hex(&info.sha256) {
        return Err(ManifestError::InvalidArtifact {
          platform,
          reason: format!("sha256 '{}' is not 64 hex characters", info.sha256),
        });
      }
      artifacts.insert(
        platform,
        ArtifactRecord {
          file_name,
          sha256: info.sha256,
        },
      );
    }

    Ok(BuildManifest {
      name: doc.name,
      version: doc.version,
      products: doc.products,
      bin_path: doc.bin_path,
      artifacts,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn platform(s: &str) -> Platform {
    s.parse().unwrap()
  }

  fn sample() -> BuildManifest {
    let mut manifest = BuildManifest::new(
      "libfoo",
      "1.2.3",
      vec![Product::Library {
        name: "libfoo".to_string(),
      }],
      "https://github.com/org/libfoo-builder/releases/download/v1.2.3",
    );
    for triplet in ["x86_64-linux-gnu", "aarch64-linux-gnu"] {
      manifest.insert(
        platform(triplet),
        ArtifactRecord {
          file_name: format!("libfoo.v1.2.3.{triplet}.tar.gz"),
          sha256: "ab".repeat(32),
        },
      );
    }
    manifest
  }

  #[test]
  fn document_uses_download_info_with_sorted_keys() {
    let json = serde_json::to_value(sample()).unwrap();
    let info = json["download_info"].as_object().unwrap();
    let keys: Vec<&String> = info.keys().collect();
    assert_eq!(keys, ["aarch64-linux-gnu", "x86_64-linux-gnu"]);
    assert_eq!(
      info["aarch64-linux-gnu"]["url"],
      "https://github.com/org/libfoo-builder/releases/download/v1.2.3/libfoo.v1.2.3.aarch64-linux-gnu.tar.gz"
    );
    assert_eq!(json["products"][0]["kind"], "library");
  }

  #[test]
  fn write_then_load() {
    let temp = TempDir::new().unwrap();
    let manifest = sample();
    let path = manifest.write(temp.path()).unwrap();

    assert_eq!(path, temp.path().join("build.json"));
    assert!(!temp.path().join("build.json.tmp").exists());
    assert_eq!(BuildManifest::load(&path).unwrap(), manifest);
  }

  #[test]
  fn missing_platform_fails_loudly() {
    let err = sample().artifact_for(&platform("x86_64-w64-mingw32")).unwrap_err();
    assert!(matches!(err, ManifestError::PlatformNotAvailable { .. }));
    assert_eq!(err.to_string(), "libfoo has no build for x86_64-w64-mingw32");
  }

  #[test]
  fn download_url_joins_bin_path() {
    let mut manifest = sample();
    manifest.bin_path.push('/');
    assert_eq!(
      manifest.download_url(&platform("x86_64-linux-gnu")).unwrap(),
      "https://github.com/org/libfoo-builder/releases/download/v1.2.3/libfoo.v1.2.3.x86_64-linux-gnu.tar.gz"
    );
  }

  #[test]
  fn unknown_platform_key_is_a_parse_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("build.json");
    fs::write(
      &path,
      r#"{"name":"x","version":"1","bin_path":"b","download_info":{"sparc-sunos":{"url":"b/x","sha256":"00"}}}"#,
    )
    .unwrap();
    assert!(matches!(BuildManifest::load(&path), Err(ManifestError::Parse { .. })));
  }

  fn load_document(body: &str) -> Result<BuildManifest, ManifestError> {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("build.json");
    fs::write(&path, body).unwrap();
    BuildManifest::load(&path)
  }

  #[test]
  fn non_hex_sha256_is_rejected() {
    let err = load_document(
      r#"{"name":"z","version":"1","bin_path":"b","download_info":{"x86_64-linux-gnu":{"url":"b/z.tar.gz","sha256":"aéééééééééééééé"}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, ManifestError::Parse { .. }));
    assert!(err.to_string().contains("not 64 hex characters"), "{err}");
  }

  #[test]
  fn file_name_must_not_leave_its_directory() {
    let sha = "ab".repeat(32);
    for url in ["b/..", "b/sub\\\\..\\\\z.tar.gz", "b/"] {
      let body = format!(
        r#"{{"name":"z","version":"1","bin_path":"b","download_info":{{"x86_64-linux-gnu":{{"url":"{url}","sha256":"{sha}"}}}}}}"#
      );
      assert!(matches!(load_document(&body), Err(ManifestError::Parse { .. })), "{url}");
    }
  }
}
