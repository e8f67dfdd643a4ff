use std::fmt;

/// Operating systems a package can be cross-compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  MacOs,
  Windows,
  FreeBsd,
}

impl Os {
  /// Parse the vendor-os component of a non-Linux triplet.
  ///
  /// Linux triplets carry an ABI suffix and are handled by [`super::Platform`].
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "linux" => Some(Self::Linux),
      "apple-darwin" => Some(Self::MacOs),
      "w64-mingw32" => Some(Self::Windows),
      "unknown-freebsd" => Some(Self::FreeBsd),
      _ => None,
    }
  }

  /// Returns the identifier used for this OS inside a triplet
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::MacOs => "apple-darwin",
      Self::Windows => "w64-mingw32",
      Self::FreeBsd => "unknown-freebsd",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
