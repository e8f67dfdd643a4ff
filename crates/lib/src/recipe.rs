//! Package recipes.
//!
//! A recipe is a TOML file naming the package, its sources, the build
//! script, the products the script must produce, and the packages it
//! depends on at build time.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::build::product::Product;
use crate::dependency::{Dependency, ManifestDependency};
use crate::manifest::ManifestError;
use crate::platform::Platform;
use crate::source::SourceSpec;
use crate::util::hash::is_sha256_hex;

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("failed to read recipe {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse recipe {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid recipe {path}: {reason}")]
  Invalid { path: PathBuf, reason: String },

  #[error("dependency {name}: {source}")]
  Dependency {
    name: String,
    #[source]
    source: ManifestError,
  },
}

/// A build-time dependency: another package's `build.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
  pub name: String,
  pub manifest: PathBuf,
}

/// Release identity pinned by the recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseConfig {
  pub repo: Option<String>,
  pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub platforms: Option<Vec<Platform>>,
  pub script: String,
  #[serde(default)]
  pub sources: Vec<SourceSpec>,
  #[serde(default)]
  pub products: Vec<Product>,
  #[serde(default)]
  pub dependencies: Vec<DependencySpec>,
  #[serde(default)]
  pub release: ReleaseConfig,
  /// Directory the recipe was loaded from.
  #[serde(skip)]
  pub dir: PathBuf,
}

impl Recipe {
  /// Read, parse, and validate a recipe. Relative paths in it are resolved
  /// against the recipe's own directory.
  pub fn load(path: &Path) -> Result<Self, RecipeError> {
    let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let mut recipe: Recipe = toml::from_str(&content).map_err(|source| RecipeError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    recipe.dir = dunce::canonicalize(parent).map_err(|source| RecipeError::Read {
      path: parent.to_path_buf(),
      source,
    })?;
    recipe.resolve_paths();
    recipe.validate().map_err(|reason| RecipeError::Invalid {
      path: path.to_path_buf(),
      reason,
    })?;

    debug!(name = %recipe.name, version = %recipe.version, sources = recipe.sources.len(), "loaded recipe");
    Ok(recipe)
  }

  fn resolve_paths(&mut self) {
    let dir = self.dir.clone();
    let absolute = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { dir.join(p) };

    for source in &mut self.sources {
      if let SourceSpec::LocalDirectory { path } = source {
        *path = absolute(path);
      }
    }
    for dependency in &mut self.dependencies {
      dependency.manifest = absolute(&dependency.manifest);
    }
  }

  fn validate(&self) -> Result<(), String> {
    if !is_plain_name(&self.name) {
      return Err(format!("package name '{}' must be non-empty and contain no path separators", self.name));
    }
    if self.version.is_empty() {
      return Err("version must not be empty".to_string());
    }
    if self.script.trim().is_empty() {
      return Err("script must not be empty".to_string());
    }
    if self.platforms.as_ref().is_some_and(Vec::is_empty) {
      return Err("platforms, when given, must list at least one platform".to_string());
    }
    for source in &self.sources {
      if let SourceSpec::RemoteArchive { url, sha256 } = source
        && !is_sha256_hex(sha256)
      {
        return Err(format!("source {url} needs a 64-character hex sha256"));
      }
    }
    for product in &self.products {
      match product {
        Product::File { path } if !stays_inside(path) => {
          return Err(format!("product path '{path}' must be relative and stay inside the prefix"));
        }
        Product::Library { name } | Product::Executable { name } if !is_plain_name(name) => {
          return Err(format!("product name '{name}' must be a plain file name"));
        }
        _ => {}
      }
    }
    if let Some(dependency) = self.dependencies.iter().find(|d| !is_plain_name(&d.name)) {
      return Err(format!("dependency name '{}' must be a plain file name", dependency.name));
    }
    let mut names: Vec<&str> = self.dependencies.iter().map(|d| d.name.as_str()).collect();
    names.sort_unstable();
    if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
      return Err(format!("dependency '{}' is declared twice", pair[0]));
    }
    Ok(())
  }

  /// Platforms to build when none are given on the command line.
  pub fn platforms(&self) -> Vec<Platform> {
    self.platforms.clone().unwrap_or_else(Platform::supported)
  }

  /// Load every declared dependency's manifest.
  pub fn load_dependencies(&self) -> Result<Vec<Arc<dyn Dependency>>, RecipeError> {
    self
      .dependencies
      .iter()
      .map(|spec| {
        let dependency = ManifestDependency::load(&spec.name, &spec.manifest).map_err(|source| RecipeError::Dependency {
          name: spec.name.clone(),
          source,
        })?;
        Ok(Arc::new(dependency) as Arc<dyn Dependency>)
      })
      .collect()
  }
}

/// A single path component other than `.` or `..`.
fn is_plain_name(name: &str) -> bool {
  !matches!(name, "" | "." | "..") && !name.contains(['/', '\\'])
}

/// A relative path with no `..`, so joining it onto a directory stays inside.
fn stays_inside(path: &str) -> bool {
  let components: Vec<Component> = Path::new(path).components().collect();
  components.iter().any(|c| matches!(c, Component::Normal(_)))
    && components.iter().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
