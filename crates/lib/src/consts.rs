//! Crate-wide constants.

/// Application name, used for cache and data directory names.
pub const APP_NAME: &str = "crossbake";

/// File name of the consumer-facing manifest document.
pub const MANIFEST_FILENAME: &str = "build.json";

/// Extension of every packaged artifact.
pub const TARBALL_EXTENSION: &str = "tar.gz";

/// Value of `SOURCE_DATE_EPOCH` handed to build scripts.
///
/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Directory inside the prefix where dependency tarballs are staged.
pub const STAGING_DIR: &str = ".staging";

/// Directory inside the prefix holding recorded dependency manifests.
pub const MANIFESTS_DIR: &str = "manifests";
