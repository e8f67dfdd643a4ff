//! Running a package's build script for one platform.
//!
//! A build succeeds when the script exits zero, every declared product is
//! found under the prefix, and the audit passes. A failing script can drop
//! into an interactive shell for inspection, but still fails the build.
//!
//! # Submodules
//!
//! - [`sandbox`] - where the script runs
//! - [`product`] - declared outputs and how to locate them
//! - [`audit`] - post-build inspection of the prefix

pub mod audit;
pub mod product;
pub mod sandbox;

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info, warn};

pub use audit::{AuditError, Auditor, SkipAudit};
pub use product::Product;
pub use sandbox::{ExecOutcome, ExecRequest, HostSandbox, Sandbox};

use crate::platform::Platform;
use crate::workspace::Workspace;

/// Lines of captured output shown when a script fails.
const FAILURE_TAIL_LINES: usize = 50;

#[derive(Debug, Error)]
pub enum BuildFailure {
  #[error("build script for {platform} failed ({})", describe_exit(.code))]
  BuildScriptFailed { platform: Platform, code: Option<i32> },

  #[error("build for {platform} did not produce {product}")]
  ProductMissing { platform: Platform, product: String },

  #[error("sandbox failed for {platform}: {source}")]
  Sandbox {
    platform: Platform,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Audit(#[from] AuditError),
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {code}"),
    None => "killed by signal".to_string(),
  }
}

/// What to build.
#[derive(Debug)]
pub struct BuildRequest<'a> {
  pub name: &'a str,
  pub products: &'a [Product],
  pub script: &'a str,
  pub workspace: &'a Workspace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildFlags {
  /// Stream script output live.
  pub verbose: bool,
  /// Open an interactive shell when the script fails.
  pub debug: bool,
}

/// Run the build script and check its products.
pub async fn run<S: Sandbox>(
  sandbox: &S,
  auditor: &dyn Auditor,
  request: &BuildRequest<'_>,
  flags: BuildFlags,
  ignore_manifests: &[PathBuf],
) -> Result<(), BuildFailure> {
  let workspace = request.workspace;
  let platform = workspace.platform();

  let exec = ExecRequest {
    name: request.name,
    script: request.script,
    platform,
    workspace,
    verbose: flags.verbose,
  };
  let outcome = sandbox
    .execute(&exec)
    .await
    .map_err(|source| BuildFailure::Sandbox { platform, source })?;

  if !outcome.success() {
    log_failure_tail(&platform, &outcome.captured);

    if flags.debug {
      warn!(platform = %platform, "build failed, entering interactive shell");
      if let Err(err) = sandbox.enter_interactive_shell(workspace).await {
        error!(platform = %platform, error = %err, "interactive shell failed");
      }
    }

    return Err(BuildFailure::BuildScriptFailed {
      platform,
      code: outcome.code,
    });
  }

  for product in request.products {
    if product.locate(workspace.prefix(), &platform).is_none() {
      return Err(BuildFailure::ProductMissing {
        platform,
        product: product.label().to_string(),
      });
    }
  }

  auditor.audit(workspace.prefix(), ignore_manifests)?;
  info!(name = %request.name, platform = %platform, "build succeeded");
  Ok(())
}

fn log_failure_tail(platform: &Platform, captured: &str) {
  if captured.is_empty() {
    return;
  }
  let lines: Vec<&str> = captured.lines().collect();
  let tail = lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
  error!(platform = %platform, "build script output (last {} lines):\n{}", FAILURE_TAIL_LINES, tail);
}
