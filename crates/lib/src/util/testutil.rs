//! Test doubles shared across the crate's unit tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::build::sandbox::{ExecOutcome, ExecRequest, Sandbox};
use crate::config::ReleaseTarget;
use crate::platform::Platform;
use crate::release::{ReleaseAsset, ReleaseError, ReleaseHost};
use crate::workspace::Workspace;

/// A sandbox that never runs a shell.
///
/// On "success" it creates the configured files under the prefix. A
/// `{triplet}` placeholder in a path or in file contents is replaced with the
/// platform being built, so artifacts differ per platform.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
  files: Vec<String>,
  exit_code: i32,
  executions: Mutex<Vec<Platform>>,
  shells: AtomicUsize,
}

impl ScriptedSandbox {
  pub fn producing(files: &[&str]) -> Self {
    Self {
      files: files.iter().map(|f| f.to_string()).collect(),
      ..Self::default()
    }
  }

  pub fn failing(exit_code: i32) -> Self {
    Self {
      exit_code,
      ..Self::default()
    }
  }

  pub fn executions(&self) -> Vec<Platform> {
    self.executions.lock().map(|e| e.clone()).unwrap_or_default()
  }

  pub fn shells_opened(&self) -> usize {
    self.shells.load(Ordering::SeqCst)
  }
}

impl Sandbox for ScriptedSandbox {
  async fn execute(&self, request: &ExecRequest<'_>) -> io::Result<ExecOutcome> {
    if let Ok(mut executions) = self.executions.lock() {
      executions.push(request.platform);
    }

    if self.exit_code != 0 {
      return Ok(ExecOutcome {
        code: Some(self.exit_code),
        captured: format!("building for {}\nerror: scripted failure\n", request.platform),
      });
    }

    let triplet = request.platform.triplet();
    for file in &self.files {
      let path = request.workspace.prefix().join(file.replace("{triplet}", &triplet));
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::write(&path, format!("{} built for {}\n", request.name, triplet))?;
    }

    Ok(ExecOutcome {
      code: Some(0),
      captured: String::new(),
    })
  }

  async fn enter_interactive_shell(&self, _workspace: &Workspace) -> io::Result<()> {
    self.shells.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

/// A "release" whose assets are the files of a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryReleases {
  dir: PathBuf,
}

impl DirectoryReleases {
  pub fn new(dir: &Path) -> Self {
    Self { dir: dir.to_path_buf() }
  }
}

impl ReleaseHost for DirectoryReleases {
  async fn list_assets(&self, _target: &ReleaseTarget) -> Result<Vec<ReleaseAsset>, ReleaseError> {
    let url = self.dir.display().to_string();
    let entries = std::fs::read_dir(&self.dir).map_err(|e| ReleaseError::Request {
      url: url.clone(),
      message: e.to_string(),
    })?;
    let mut assets: Vec<ReleaseAsset> = entries
      .filter_map(Result::ok)
      .filter(|entry| entry.path().is_file())
      .map(|entry| ReleaseAsset {
        name: entry.file_name().to_string_lossy().into_owned(),
        download_url: entry.path().display().to_string(),
      })
      .collect();
    assets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(assets)
  }

  async fn fetch_asset(&self, asset: &ReleaseAsset) -> Result<Vec<u8>, ReleaseError> {
    std::fs::read(&asset.download_url).map_err(|e| ReleaseError::Request {
      url: asset.download_url.clone(),
      message: e.to_string(),
    })
  }
}

/// A local repository that git sources sync from over `file://`.
pub struct GitUpstream {
  repo: gix::Repository,
  pub url: String,
}

impl GitUpstream {
  pub fn init(path: &Path) -> Self {
    let repo = gix::init(path).unwrap();
    Self {
      repo,
      url: format!("file://{}", path.display()),
    }
  }

  /// Commit a tree holding a single `VERSION` file on top of HEAD.
  pub fn commit_version(&self, contents: &str) -> String {
    let blob = self.repo.write_blob(contents.as_bytes()).unwrap().detach();
    let tree = gix::objs::Tree {
      entries: vec![gix::objs::tree::Entry {
        mode: gix::objs::tree::EntryKind::Blob.into(),
        filename: "VERSION".into(),
        oid: blob,
      }],
    };
    let tree = self.repo.write_object(&tree).unwrap().detach();
    let parents: Vec<gix::ObjectId> = self.repo.head_id().ok().map(|id| id.detach()).into_iter().collect();
    let signature = gix::actor::SignatureRef {
      name: "Crossbake".into(),
      email: "builds@example.com".into(),
      time: "1700000000 +0000",
    };
    self
      .repo
      .commit_as(signature, signature, "HEAD", contents, tree, parents)
      .unwrap()
      .to_string()
  }
}
