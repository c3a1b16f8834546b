//! Fork resolution for the EELS resolver.
//!
//! A fork name selects a version of the execution specs. This crate turns a fork
//! name into a directory on disk holding that version's code:
//!
//! - [`Resolution`]: the closed set of rules (local path, alias, git reference).
//! - [`ResolutionTable`]: built-in defaults merged with at most one override source.
//! - [`Resolver`]: the single dispatch point, which caches git snapshots under a
//!   per-fork cross-process lock and revalidates unpinned branches.
//!
//! Snapshot retrieval goes through [`SnapshotSource`] so the cache protocol can be
//! exercised without a network.

#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod lock;
pub mod name;
pub mod resolution;
pub mod resolver;
pub mod source;
pub mod table;

pub use error::{ConfigError, ResolveError};
pub use name::validate_fork_name;
pub use resolution::{GitResolution, LocalResolution, Resolution, SameAsResolution};
pub use resolver::{ResolvedFork, Resolver, ResolverConfig};
pub use source::{GitCli, SnapshotSource};
pub use table::{ConcreteRule, OverrideSource, ResolutionTable};

/// Directory name used under the cache and runtime roots.
pub const APP_DIR_NAME: &str = "ethereum-spec-evm-resolver";
