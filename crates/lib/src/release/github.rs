//! GitHub releases over the REST API.

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use super::{ReleaseAsset, ReleaseError, ReleaseHost};
use crate::config::ReleaseTarget;
use crate::consts::APP_NAME;

const DEFAULT_API: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
  #[serde(default)]
  assets: Vec<AssetResponse>,
}

#[derive(Debug, Deserialize)]
struct AssetResponse {
  name: String,
  browser_download_url: String,
}

#[derive(Debug, Clone)]
pub struct GitHubReleases {
  client: reqwest::Client,
  api_base: String,
  token: Option<String>,
}

impl Default for GitHubReleases {
  fn default() -> Self {
    Self::new(reqwest::Client::new())
  }
}

impl GitHubReleases {
  pub fn new(client: reqwest::Client) -> Self {
    Self {
      client,
      api_base: DEFAULT_API.to_string(),
      token: None,
    }
  }

  /// Authenticate with `GITHUB_TOKEN` when it is set.
  pub fn from_env() -> Self {
    let mut releases = Self::default();
    releases.token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
    releases
  }

  pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
    self.api_base = api_base.into();
    self
  }

  fn headers(&self) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(APP_NAME));
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    if let Some(token) = &self.token
      && let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}"))
    {
      headers.insert(AUTHORIZATION, value);
    }
    headers
  }

  async fn get(&self, url: &str) -> Result<reqwest::Response, ReleaseError> {
    let response = self
      .client
      .get(url)
      .headers(self.headers())
      .send()
      .await
      .map_err(|e| ReleaseError::Request {
        url: url.to_string(),
        message: e.to_string(),
      })?;
    if !response.status().is_success() {
      return Err(ReleaseError::Status {
        url: url.to_string(),
        status: response.status().as_u16(),
      });
    }
    Ok(response)
  }
}

impl ReleaseHost for GitHubReleases {
  async fn list_assets(&self, target: &ReleaseTarget) -> Result<Vec<ReleaseAsset>, ReleaseError> {
    let url = format!(
      "{}/repos/{}/releases/tags/{}",
      self.api_base.trim_end_matches('/'),
      target.repo,
      target.tag
    );
    debug!(url = %url, "listing release assets");

    let release: ReleaseResponse = self.get(&url).await?.json().await.map_err(|e| ReleaseError::Decode {
      url: url.clone(),
      message: e.to_string(),
    })?;

    Ok(
      release
        .assets
        .into_iter()
        .map(|asset| ReleaseAsset {
          name: asset.name,
          download_url: asset.browser_download_url,
        })
        .collect(),
    )
  }

  async fn fetch_asset(&self, asset: &ReleaseAsset) -> Result<Vec<u8>, ReleaseError> {
    debug!(asset = %asset.name, "downloading release asset");
    let bytes = self
      .get(&asset.download_url)
      .await?
      .bytes()
      .await
      .map_err(|e| ReleaseError::Request {
        url: asset.download_url.clone(),
        message: e.to_string(),
      })?;
    Ok(bytes.to_vec())
  }
}
