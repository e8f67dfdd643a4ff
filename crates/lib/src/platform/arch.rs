use std::fmt;

/// CPU architectures a package can be cross-compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  X86_64,
  I686,
  Aarch64,
  Armv7l,
  Powerpc64le,
}

impl Arch {
  /// Parse the architecture component of a triplet
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "x86_64" => Some(Self::X86_64),
      "i686" => Some(Self::I686),
      "aarch64" => Some(Self::Aarch64),
      "armv7l" => Some(Self::Armv7l),
      "powerpc64le" => Some(Self::Powerpc64le),
      _ => None,
    }
  }

  /// Returns the lowercase string identifier for this architecture
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::X86_64 => "x86_64",
      Self::I686 => "i686",
      Self::Aarch64 => "aarch64",
      Self::Armv7l => "armv7l",
      Self::Powerpc64le => "powerpc64le",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
