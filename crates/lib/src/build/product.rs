//! Declared build products and where to find them under a prefix.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::platform::{Os, Platform};

/// An artifact the build script must leave under the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Product {
  /// A shared library, e.g. `libfoo`.
  Library { name: String },
  /// A program in `bin/`.
  Executable { name: String },
  /// Any file, by path relative to the prefix.
  File { path: String },
}

impl Product {
  pub fn label(&self) -> &str {
    match self {
      Product::Library { name } | Product::Executable { name } => name,
      Product::File { path } => path,
    }
  }

  /// Find this product under `prefix` as built for `platform`.
  pub fn locate(&self, prefix: &Path, platform: &Platform) -> Option<PathBuf> {
    match self {
      Product::Library { name } => {
        let dir = if platform.is_windows() { "bin" } else { "lib" };
        first_match(&prefix.join(dir), |file| library_matches(name, file, platform.os))
      }
      Product::Executable { name } => {
        let file = if platform.is_windows() {
          format!("{name}.exe")
        } else {
          name.clone()
        };
        let path = prefix.join("bin").join(file);
        path.is_file().then_some(path)
      }
      Product::File { path } => {
        let path = prefix.join(path);
        path.exists().then_some(path)
      }
    }
  }
}

fn library_matches(name: &str, file: &str, os: Os) -> bool {
  match os {
    Os::Linux | Os::FreeBsd => file.starts_with(&format!("{name}.so")),
    Os::MacOs => file.starts_with(name) && file.ends_with(".dylib"),
    Os::Windows => file.starts_with(name) && file.ends_with(".dll"),
  }
}

fn first_match(dir: &Path, matches: impl Fn(&str) -> bool) -> Option<PathBuf> {
  let mut found: Vec<PathBuf> = fs::read_dir(dir)
    .ok()?
    .filter_map(Result::ok)
    .filter(|entry| matches(&entry.file_name().to_string_lossy()))
    .map(|entry| entry.path())
    .collect();
  found.sort();
  found.into_iter().next()
}
