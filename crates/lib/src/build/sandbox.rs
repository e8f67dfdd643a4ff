//! Build script execution.
//!
//! The [`Sandbox`] trait is the seam to whatever isolates a build. The bundled
//! [`HostSandbox`] runs the script with `/bin/sh` on the host, in a cleared
//! and pinned environment with the shard's tool directories first on `PATH`.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::SOURCE_DATE_EPOCH;
use crate::platform::Platform;
use crate::workspace::Workspace;

/// Host directories searched after the shard's own.
const HOST_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// One build script invocation.
#[derive(Debug)]
pub struct ExecRequest<'a> {
  pub name: &'a str,
  pub script: &'a str,
  pub platform: Platform,
  pub workspace: &'a Workspace,
  /// Stream output live instead of capturing it.
  pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
  /// `None` when the script was killed by a signal.
  pub code: Option<i32>,
  /// Combined stdout and stderr; empty in verbose mode.
  pub captured: String,
}

impl ExecOutcome {
  pub fn success(&self) -> bool {
    self.code == Some(0)
  }
}

pub trait Sandbox: Send + Sync {
  /// Run the script against the workspace prefix.
  fn execute(&self, request: &ExecRequest<'_>) -> impl Future<Output = io::Result<ExecOutcome>> + Send;

  /// Hand the terminal to an interactive shell in the same environment.
  fn enter_interactive_shell(&self, workspace: &Workspace) -> impl Future<Output = io::Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct HostSandbox {
  shell: PathBuf,
  nproc: usize,
}

impl Default for HostSandbox {
  fn default() -> Self {
    Self {
      shell: PathBuf::from("/bin/sh"),
      nproc: std::thread::available_parallelism().map(usize::from).unwrap_or(1),
    }
  }
}

impl HostSandbox {
  pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
    self.shell = shell.into();
    self
  }

  /// Build the command with the pinned environment, without the script.
  fn command(&self, workspace: &Workspace) -> io::Result<Command> {
    let tmp_dir = workspace.root().join("tmp");
    std::fs::create_dir_all(&tmp_dir)?;

    let mut command = Command::new(&self.shell);
    command
      .current_dir(workspace.srcdir())
      .env_clear()
      .env("PATH", search_path(&workspace.shard().root))
      .env("HOME", workspace.root())
      .env("TMPDIR", &tmp_dir)
      .env("prefix", workspace.prefix())
      .env("WORKSPACE", workspace.root())
      .env("srcdir", workspace.srcdir())
      .env("target", workspace.platform().triplet())
      .env("nproc", self.nproc.to_string())
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);
    Ok(command)
  }
}

impl Sandbox for HostSandbox {
  async fn execute(&self, request: &ExecRequest<'_>) -> io::Result<ExecOutcome> {
    info!(name = %request.name, platform = %request.platform, "running build script");

    let mut command = self.command(request.workspace)?;
    command.arg("-c").arg(request.script);
    debug!(shell = %self.shell.display(), cwd = %request.workspace.srcdir().display(), "spawning process");

    if request.verbose {
      let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await?;
      return Ok(ExecOutcome {
        code: status.code(),
        captured: String::new(),
      });
    }

    let output = command.stdin(Stdio::null()).output().await?;
    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    captured.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ExecOutcome {
      code: output.status.code(),
      captured,
    })
  }

  async fn enter_interactive_shell(&self, workspace: &Workspace) -> io::Result<()> {
    info!(platform = %workspace.platform(), prefix = %workspace.prefix().display(), "starting interactive shell");
    let status = self
      .command(workspace)?
      .arg("-i")
      .stdin(Stdio::inherit())
      .stdout(Stdio::inherit())
      .stderr(Stdio::inherit())
      .status()
      .await?;
    debug!(code = ?status.code(), "interactive shell exited");
    Ok(())
  }
}

/// `PATH` with the shard's tool directories ahead of the host's.
pub fn search_path(shard_root: &Path) -> String {
  let mut dirs: Vec<String> = ["bin", "usr/bin", "usr/local/bin"]
    .iter()
    .map(|dir| shard_root.join(dir))
    .filter(|dir| dir.is_dir())
    .map(|dir| dir.display().to_string())
    .collect();
  dirs.push(HOST_PATH.to_string());
  dirs.join(":")
}
