use std::fmt;

/// C library / calling-convention variant of a Linux target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abi {
  Gnu,
  Musl,
  GnuEabihf,
  MuslEabihf,
}

impl Abi {
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "gnu" => Some(Self::Gnu),
      "musl" => Some(Self::Musl),
      "gnueabihf" => Some(Self::GnuEabihf),
      "musleabihf" => Some(Self::MuslEabihf),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Gnu => "gnu",
      Self::Musl => "musl",
      Self::GnuEabihf => "gnueabihf",
      Self::MuslEabihf => "musleabihf",
    }
  }

  /// Whether this is one of the hard-float ARM variants
  pub fn is_eabihf(&self) -> bool {
    matches!(self, Self::GnuEabihf | Self::MuslEabihf)
  }
}

impl fmt::Display for Abi {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
