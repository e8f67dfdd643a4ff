//! Target platforms.
//!
//! A [`Platform`] is the (architecture, OS, ABI) combination a package is
//! cross-compiled for. Its canonical string form is the triplet used in
//! artifact file names, manifest keys, and CLI arguments, e.g.
//! `x86_64-linux-gnu` or `aarch64-apple-darwin`.

pub mod abi;
pub mod arch;
pub mod os;
pub mod paths;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use abi::Abi;
pub use arch::Arch;
pub use os::Os;

use crate::consts::TARBALL_EXTENSION;

/// Errors produced while parsing or constructing a platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
  #[error("unrecognized platform triplet '{0}'")]
  Unrecognized(String),

  #[error("linux platforms require an ABI suffix (gnu, musl, gnueabihf, musleabihf)")]
  MissingAbi,

  #[error("ABI '{abi}' is not valid for {os}")]
  UnexpectedAbi { os: Os, abi: Abi },

  #[error("ABI '{abi}' does not match architecture {arch}")]
  MismatchedAbi { arch: Arch, abi: Abi },
}

/// Target triplet: architecture, OS, and (for Linux) libc/ABI variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
  pub abi: Option<Abi>,
}

impl Platform {
  /// Create a platform, rejecting combinations no toolchain exists for.
  pub fn new(arch: Arch, os: Os, abi: Option<Abi>) -> Result<Self, PlatformError> {
    match (os, abi) {
      (Os::Linux, None) => return Err(PlatformError::MissingAbi),
      (Os::Linux, Some(abi)) => {
        let arm = arch == Arch::Armv7l;
        if arm != abi.is_eabihf() {
          return Err(PlatformError::MismatchedAbi { arch, abi });
        }
      }
      (os, Some(abi)) => return Err(PlatformError::UnexpectedAbi { os, abi }),
      (_, None) => {}
    }
    Ok(Self { arch, os, abi })
  }

  /// Returns the canonical triplet (e.g., "x86_64-linux-gnu")
  pub fn triplet(&self) -> String {
    match self.abi {
      Some(abi) => format!("{}-{}-{}", self.arch, self.os, abi),
      None => format!("{}-{}", self.arch, self.os),
    }
  }

  pub fn is_windows(&self) -> bool {
    self.os == Os::Windows
  }

  pub fn is_macos(&self) -> bool {
    self.os == Os::MacOs
  }

  /// Recover the platform from an artifact file name of the form
  /// `{base}.{triplet}.tar.gz`.
  ///
  /// Returns `None` when the name does not end in a recognizable triplet.
  pub fn from_artifact_name(name: &str) -> Option<Self> {
    let stem = name
      .strip_suffix(&format!(".{}", TARBALL_EXTENSION))
      .or_else(|| name.strip_suffix(".tgz"))?;
    let (_, triplet) = stem.rsplit_once('.')?;
    triplet.parse().ok()
  }

  /// The default set of platforms built when a recipe does not list its own.
  pub fn supported() -> Vec<Platform> {
    use Abi::*;
    use Arch::*;
    let linux = |arch, abi| Platform {
      arch,
      os: Os::Linux,
      abi: Some(abi),
    };
    let bare = |arch, os| Platform { arch, os, abi: None };
    vec![
      linux(I686, Gnu),
      linux(X86_64, Gnu),
      linux(Aarch64, Gnu),
      linux(Armv7l, GnuEabihf),
      linux(Powerpc64le, Gnu),
      linux(I686, Musl),
      linux(X86_64, Musl),
      linux(Aarch64, Musl),
      linux(Armv7l, MuslEabihf),
      bare(X86_64, Os::MacOs),
      bare(X86_64, Os::FreeBsd),
      bare(I686, Os::Windows),
      bare(X86_64, Os::Windows),
    ]
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triplet())
  }
}

impl FromStr for Platform {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let unrecognized = || PlatformError::Unrecognized(s.to_string());

    let (arch, rest) = s.split_once('-').ok_or_else(unrecognized)?;
    let arch = Arch::parse(arch).ok_or_else(unrecognized)?;

    if let Some(abi) = rest.strip_prefix("linux-") {
      let abi = Abi::parse(abi).ok_or_else(unrecognized)?;
      return Platform::new(arch, Os::Linux, Some(abi));
    }

    let os = Os::parse(rest).ok_or_else(unrecognized)?;
    Platform::new(arch, os, None)
  }
}

// Ordered by triplet text so manifest keys serialize alphabetically.
impl Ord for Platform {
  fn cmp(&self, other: &Self) -> Ordering {
    self.triplet().cmp(&other.triplet())
  }
}

impl PartialOrd for Platform {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Serialize for Platform {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Platform {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Parse a comma-separated triplet list, as accepted on the command line.
pub fn parse_platform_list(list: &str) -> Result<Vec<Platform>, PlatformError> {
  list
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::parse)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn triplet_format() {
    let p = Platform::new(Arch::X86_64, Os::Linux, Some(Abi::Gnu)).unwrap();
    assert_eq!(p.triplet(), "x86_64-linux-gnu");

    let p = Platform::new(Arch::Aarch64, Os::MacOs, None).unwrap();
    assert_eq!(p.triplet(), "aarch64-apple-darwin");
  }

  #[test]
  fn every_supported_platform_parses_back() {
    for platform in Platform::supported() {
      let parsed: Platform = platform.triplet().parse().unwrap();
      assert_eq!(parsed, platform);
    }
  }

  #[test]
  fn linux_without_abi_is_rejected() {
    assert_eq!(
      Platform::new(Arch::X86_64, Os::Linux, None),
      Err(PlatformError::MissingAbi)
    );
    assert!("x86_64-linux".parse::<Platform>().is_err());
  }

  #[test]
  fn eabihf_requires_arm() {
    assert!("x86_64-linux-gnueabihf".parse::<Platform>().is_err());
    assert!("armv7l-linux-gnu".parse::<Platform>().is_err());
    assert!("armv7l-linux-musleabihf".parse::<Platform>().is_ok());
  }

  #[test]
  fn abi_on_non_linux_is_rejected() {
    assert!(matches!(
      Platform::new(Arch::X86_64, Os::Windows, Some(Abi::Gnu)),
      Err(PlatformError::UnexpectedAbi { .. })
    ));
  }

  #[test]
  fn recovers_platform_from_artifact_name() {
    let p = Platform::from_artifact_name("libfoo.v1.2.3.aarch64-linux-gnu.tar.gz").unwrap();
    assert_eq!(p.triplet(), "aarch64-linux-gnu");

    let p = Platform::from_artifact_name("libfoo.v1.0.0.x86_64-w64-mingw32.tar.gz").unwrap();
    assert!(p.is_windows());
  }

  #[test]
  fn artifact_name_without_triplet_is_none() {
    assert_eq!(Platform::from_artifact_name("build.json"), None);
    assert_eq!(Platform::from_artifact_name("libfoo.v1.2.3.tar.gz"), None);
    assert_eq!(Platform::from_artifact_name("libfoo.v1.2.3.sparc-sunos.tar.gz"), None);
  }

  #[test]
  fn ordering_follows_triplet_text() {
    let mut platforms: Vec<Platform> = ["x86_64-linux-gnu", "aarch64-linux-gnu", "i686-w64-mingw32"]
      .iter()
      .map(|s| s.parse().unwrap())
      .collect();
    platforms.sort();
    let triplets: Vec<String> = platforms.iter().map(Platform::triplet).collect();
    assert_eq!(triplets, ["aarch64-linux-gnu", "i686-w64-mingw32", "x86_64-linux-gnu"]);
  }

  #[test]
  fn serializes_as_triplet_string() {
    let p: Platform = "x86_64-unknown-freebsd".parse().unwrap();
    assert_eq!(serde_json::to_string(&p).unwrap(), "\"x86_64-unknown-freebsd\"");
    let back: Platform = serde_json::from_str("\"x86_64-unknown-freebsd\"").unwrap();
    assert_eq!(back, p);
  }

  #[test]
  fn platform_list_skips_blanks() {
    let list = parse_platform_list("x86_64-linux-gnu, aarch64-linux-musl,").unwrap();
    assert_eq!(list.len(), 2);
    assert!(parse_platform_list("x86_64-linux-gnu,bogus").is_err());
  }
}
