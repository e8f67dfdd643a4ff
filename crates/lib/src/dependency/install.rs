use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::{Dependency, DependencyManifest};
use crate::manifest::ManifestError;
use crate::platform::paths;
use crate::source::{SourceError, fetch_archive};
use crate::util::tarball;
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("dependency {dependency}: {source}")]
  Descriptor {
    dependency: String,
    #[source]
    source: ManifestError,
  },

  #[error("dependency {dependency}: {source}")]
  Fetch {
    dependency: String,
    #[source]
    source: SourceError,
  },

  #[error("dependency {dependency}: failed to install {path}: {source}")]
  Unpack {
    dependency: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Installs dependency tarballs into a workspace prefix.
#[derive(Debug, Clone)]
pub struct DependencyInstaller {
  client: reqwest::Client,
  downloads_dir: PathBuf,
}

impl Default for DependencyInstaller {
  fn default() -> Self {
    Self::new(reqwest::Client::new(), paths::downloads_dir())
  }
}

impl DependencyInstaller {
  pub fn new(client: reqwest::Client, downloads_dir: PathBuf) -> Self {
    Self { client, downloads_dir }
  }

  /// Install every dependency for the workspace's platform.
  ///
  /// Each tarball is fetched into the downloads cache, staged under the
  /// prefix, and unpacked into it. The files it wrote are recorded in
  /// `manifests/{name}.list`.
  pub async fn install(
    &self,
    workspace: &Workspace,
    dependencies: &[Arc<dyn Dependency>],
  ) -> Result<Vec<DependencyManifest>, InstallError> {
    let platform = workspace.platform();
    let mut installed = Vec::with_capacity(dependencies.len());

    for dependency in dependencies {
      let name = dependency.name().to_string();
      let descriptor = dependency
        .descriptor(&platform)
        .map_err(|source| InstallError::Descriptor {
          dependency: name.clone(),
          source,
        })?;

      let cached = fetch_archive(
        &self.client,
        &descriptor.url,
        &descriptor.artifact.sha256,
        &self.downloads_dir,
      )
      .await
      .map_err(|source| InstallError::Fetch {
        dependency: name.clone(),
        source,
      })?;

      let unpack_error = |path: PathBuf, source: io::Error| InstallError::Unpack {
        dependency: name.clone(),
        path,
        source,
      };

      let staging = workspace.staging_dir();
      fs::create_dir_all(&staging).map_err(|e| unpack_error(staging.clone(), e))?;
      let staged = staging.join(&descriptor.artifact.file_name);
      fs::copy(&cached.path, &staged).map_err(|e| unpack_error(staged.clone(), e))?;

      let files = tarball::extract(&staged, workspace.prefix()).map_err(|e| unpack_error(staged.clone(), e))?;
      let record = DependencyManifest {
        dependency: name.clone(),
        files,
      };
      let record_path = record
        .save(&workspace.manifests_dir())
        .map_err(|e| unpack_error(workspace.manifests_dir(), e))?;

      debug!(dependency = %name, record = %record_path.display(), "recorded installed files");
      info!(dependency = %name, platform = %platform, files = record.files.len(), "installed dependency");
      installed.push(record);
    }

    Ok(installed)
  }
}
