use crate::consts::APP_NAME;
use std::path::PathBuf;

/// Environment variable overriding the cache root.
pub const CACHE_ENV: &str = "CROSSBAKE_CACHE";

/// Returns the user's home directory
///
/// Falls back to the system temp directory when `HOME` is unset, which is
/// common inside minimal CI containers.
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for cache files for the application
///
/// Precedence: `CROSSBAKE_CACHE`, then `$XDG_CACHE_HOME/crossbake`, then
/// `~/.cache/crossbake`.
pub fn cache_dir() -> PathBuf {
  if let Ok(dir) = std::env::var(CACHE_ENV) {
    return PathBuf::from(dir);
  }
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Shared downloads cache for remote and archived local sources.
pub fn downloads_dir() -> PathBuf {
  cache_dir().join("downloads")
}

/// Bare git clones of git sources.
pub fn git_dir() -> PathBuf {
  cache_dir().join("git")
}

/// Default location of pre-extracted shard roots.
pub fn shards_dir() -> PathBuf {
  cache_dir().join("shards")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn explicit_cache_env_takes_precedence() {
    temp_env::with_vars(
      [
        (CACHE_ENV, Some("/srv/crossbake")),
        ("XDG_CACHE_HOME", Some("/custom/cache")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/srv/crossbake"));
        assert_eq!(downloads_dir(), PathBuf::from("/srv/crossbake/downloads"));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_cache_home_is_used() {
    temp_env::with_vars(
      [(CACHE_ENV, None::<&str>), ("XDG_CACHE_HOME", Some("/custom/cache"))],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/custom/cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn falls_back_to_home_cache() {
    temp_env::with_vars(
      [
        (CACHE_ENV, None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/home/user/.cache").join(APP_NAME));
        assert_eq!(git_dir(), PathBuf::from("/home/user/.cache/crossbake/git"));
      },
    );
  }
}
