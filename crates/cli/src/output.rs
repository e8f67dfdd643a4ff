//! Terminal output for a build run.
//!
//! Everything here is for people watching the run; machine-readable results
//! live in `build.json`.

use std::path::Path;
use std::time::Duration;

use owo_colors::{OwoColorize, Stream};

use crossbake_lib::manifest::ArtifactRecord;
use crossbake_lib::orchestrator::partition::Partition;

pub mod marks {
  pub const BUILT: &str = "✓";
  pub const FAILED: &str = "✗";
  pub const NOTE: &str = "›";
}

/// Leading 12 characters of a sha256, or the whole value if it is shorter.
pub fn short_sha(sha256: &str) -> &str {
  sha256.get(..12).unwrap_or(sha256)
}

/// Tarball size in binary units.
pub fn human_size(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
  if bytes < 1024 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

/// Wall-clock time of a run: milliseconds below one second, whole seconds
/// otherwise.
pub fn elapsed(duration: Duration) -> String {
  if duration < Duration::from_secs(1) {
    format!("{}ms", duration.as_millis())
  } else {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
  }
}

pub fn print_run_header(name: &str, version: &str, platforms: usize, part: Option<&Partition>, only_manifest: bool) {
  let what = if only_manifest { "Collecting" } else { "Building" };
  let scope = match part {
    Some(part) => format!("{platforms} platforms, part {part}"),
    None => format!("{platforms} platforms"),
  };
  println!(
    "{} {} {} v{} ({})",
    marks::NOTE.if_supports_color(Stream::Stdout, |s| s.blue()),
    what,
    name.if_supports_color(Stream::Stdout, |s| s.bold()),
    version,
    scope
  );
}

/// One line per tarball: platform, file name, short hash, and size when the
/// tarball is on disk.
pub fn print_artifact(triplet: &str, record: &ArtifactRecord, size: Option<u64>) {
  let size = size.map(human_size).unwrap_or_else(|| "in release".to_string());
  println!(
    "  {} {:<26} {}  sha256:{}  {}",
    marks::BUILT.if_supports_color(Stream::Stdout, |s| s.green()),
    triplet,
    record.file_name,
    short_sha(&record.sha256).if_supports_color(Stream::Stdout, |s| s.dimmed()),
    size
  );
}

pub fn print_outcome(name: &str, version: &str, tarballs: usize, duration: Duration) {
  if tarballs == 0 {
    eprintln!(
      "{} {} v{}: nothing was built",
      marks::FAILED.if_supports_color(Stream::Stderr, |s| s.yellow()),
      name,
      version
    );
    return;
  }
  println!(
    "{} {} v{} complete: {} tarball{} in {}",
    marks::BUILT.if_supports_color(Stream::Stdout, |s| s.green()),
    name,
    version,
    tarballs,
    if tarballs == 1 { "" } else { "s" },
    elapsed(duration)
  );
}

pub fn print_manifest(path: &Path) {
  println!(
    "  {} build.json: {}",
    marks::NOTE.if_supports_color(Stream::Stdout, |s| s.blue()),
    path.display()
  );
}

/// Partitioned runs leave the manifest to a later `--only-buildjl` run.
pub fn print_partial(output_dir: &Path) {
  println!(
    "  {} Partitioned run: tarballs are in {}; run --only-buildjl once every part is released",
    marks::NOTE.if_supports_color(Stream::Stdout, |s| s.blue()),
    output_dir.display()
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    marks::FAILED.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}
