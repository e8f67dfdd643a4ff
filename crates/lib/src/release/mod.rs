//! Rebuilding a manifest from an already-published release.
//!
//! Partitioned CI runs each upload their tarballs but write no manifest.
//! Once every part has finished, the [`ReleaseReconstructor`] lists the
//! release's assets, hashes each platform tarball, and produces the
//! platform-to-artifact map a single unpartitioned run would have.

pub mod github;

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;
use tracing::{info, warn};

pub use github::GitHubReleases;

use crate::config::ReleaseTarget;
use crate::consts::MANIFEST_FILENAME;
use crate::manifest::ArtifactRecord;
use crate::platform::Platform;
use crate::util::hash::hash_bytes;

#[derive(Debug, Error)]
pub enum ReleaseError {
  #[error("request to {url} failed: {message}")]
  Request { url: String, message: String },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("unexpected response from {url}: {message}")]
  Decode { url: String, message: String },
}

/// An asset whose name encodes no platform. Skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("release asset {asset} does not name a known platform")]
pub struct UnknownPlatformInAsset {
  pub asset: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
  pub name: String,
  pub download_url: String,
}

/// Read access to published releases.
pub trait ReleaseHost: Send + Sync {
  fn list_assets(&self, target: &ReleaseTarget) -> impl Future<Output = Result<Vec<ReleaseAsset>, ReleaseError>> + Send;

  fn fetch_asset(&self, asset: &ReleaseAsset) -> impl Future<Output = Result<Vec<u8>, ReleaseError>> + Send;
}

#[derive(Debug, Default)]
pub struct Reconstruction {
  pub artifacts: BTreeMap<Platform, ArtifactRecord>,
  pub skipped: Vec<UnknownPlatformInAsset>,
}

pub struct ReleaseReconstructor<H> {
  host: H,
  name_filter: Option<String>,
}

impl<H: ReleaseHost> ReleaseReconstructor<H> {
  pub fn new(host: H) -> Self {
    Self {
      host,
      name_filter: None,
    }
  }

  /// Only consider assets whose name contains `filter`.
  pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
    self.name_filter = Some(filter.into());
    self
  }

  pub async fn reconstruct(&self, target: &ReleaseTarget) -> Result<Reconstruction, ReleaseError> {
    let assets = self.host.list_assets(target).await?;
    info!(repo = %target.repo, tag = %target.tag, assets = assets.len(), "reconstructing manifest from release");

    let mut result = Reconstruction::default();
    for asset in assets {
      if asset.name == MANIFEST_FILENAME {
        continue;
      }
      if let Some(filter) = &self.name_filter
        && !asset.name.contains(filter.as_str())
      {
        continue;
      }

      let Some(platform) = Platform::from_artifact_name(&asset.name) else {
        let skipped = UnknownPlatformInAsset { asset: asset.name };
        warn!("{}, skipping", skipped);
        result.skipped.push(skipped);
        continue;
      };

      let bytes = self.host.fetch_asset(&asset).await?;
      let sha256 = hash_bytes(&bytes).0;
      if result.artifacts.contains_key(&platform) {
        warn!(platform = %platform, asset = %asset.name, "several assets for one platform, keeping the last");
      }
      result.artifacts.insert(
        platform,
        ArtifactRecord {
          file_name: asset.name,
          sha256,
        },
      );
    }

    Ok(result)
  }
}
