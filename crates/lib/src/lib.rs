//! crossbake-lib: building one package for many platforms.
//!
//! A [`recipe::Recipe`] names sources, a build script, and the products the
//! script must leave in the install prefix. The [`orchestrator`] builds it
//! once per target platform inside a mounted root filesystem shard, packages
//! each prefix into a content-hashed tarball, and writes a `build.json`
//! manifest that downstream packages consume as a dependency.

pub mod build;
pub mod cache_lock;
pub mod config;
pub mod consts;
pub mod dependency;
pub mod manifest;
pub mod orchestrator;
pub mod package;
pub mod platform;
pub mod recipe;
pub mod release;
pub mod shard;
pub mod source;
pub mod util;
pub mod workspace;
