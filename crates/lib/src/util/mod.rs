//! Shared utilities.
//!
//! Hashing, deterministic tarballs, and test helpers.

pub mod hash;
pub mod tarball;

#[cfg(test)]
pub mod testutil;
