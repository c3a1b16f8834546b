//! Turning fork names into directories on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::cache::{CacheEntry, CacheLayout};
use crate::lock::ForkLock;
use crate::resolution::GitResolution;
use crate::source::{GitCli, SnapshotSource};
use crate::table::{ConcreteRule, ResolutionTable};
use crate::{APP_DIR_NAME, ResolveError, validate_fork_name};

#[cfg(test)]
mod tests;

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "EELS_CACHE_DIR";

/// How long an unpinned snapshot is trusted before the remote is consulted.
pub const DEFAULT_REVALIDATE_AFTER: Duration = Duration::from_secs(3 * 60 * 60);

/// Maximum number of `same_as` hops followed for one lookup.
pub const DEFAULT_MAX_ALIAS_HOPS: usize = 100;

/// Tunables of the resolution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
	/// Directory holding snapshots, cache entries and lock files.
	pub cache_root: PathBuf,
	/// Age below which an unpinned snapshot is reused without a remote check.
	pub revalidate_after: Duration,
	/// Maximum number of alias hops.
	pub max_alias_hops: usize,
}

impl ResolverConfig {
	/// Uses `cache_root` with default tunables.
	pub fn new(cache_root: impl Into<PathBuf>) -> Self {
		Self {
			cache_root: cache_root.into(),
			revalidate_after: DEFAULT_REVALIDATE_AFTER,
			max_alias_hops: DEFAULT_MAX_ALIAS_HOPS,
		}
	}

	/// Cache root from `EELS_CACHE_DIR`, else the user cache directory.
	pub fn from_env() -> Self {
		let cache_root = std::env::var_os(CACHE_DIR_ENV)
			.map(PathBuf::from)
			.unwrap_or_else(default_cache_root);
		Self::new(cache_root)
	}

	/// Sets the revalidation window.
	#[must_use]
	pub fn revalidate_after(mut self, window: Duration) -> Self {
		self.revalidate_after = window;
		self
	}
}

fn default_cache_root() -> PathBuf {
	dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join(APP_DIR_NAME)
}

/// A fork materialized on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFork {
	/// Fork owning the concrete rule (differs from the request for aliases).
	pub source_fork: String,
	/// Root of the code.
	pub path: PathBuf,
}

impl ResolvedFork {
	/// Directory to put on the tool's module search path.
	pub fn src_dir(&self) -> PathBuf {
		self.path.join("src")
	}
}

/// The resolution engine.
///
/// Holds the immutable rule table and the cache root. Cheap to share behind an
/// [`Arc`]; all mutable state lives on disk under per-fork locks.
pub struct Resolver {
	table: Arc<ResolutionTable>,
	layout: CacheLayout,
	config: ResolverConfig,
	source: Arc<dyn SnapshotSource>,
}

impl std::fmt::Debug for Resolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Resolver")
			.field("cache_root", &self.layout.root())
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}

impl Resolver {
	/// Creates a resolver fetching through the `git` executable.
	pub fn new(table: Arc<ResolutionTable>, config: ResolverConfig) -> Self {
		Self::with_source(table, config, Arc::new(GitCli::locate()))
	}

	/// Creates a resolver with a custom snapshot source.
	pub fn with_source(table: Arc<ResolutionTable>, config: ResolverConfig, source: Arc<dyn SnapshotSource>) -> Self {
		Self {
			table,
			layout: CacheLayout::new(config.cache_root.clone()),
			config,
			source,
		}
	}

	/// The rule table.
	pub fn table(&self) -> &ResolutionTable {
		&self.table
	}

	/// The cache layout.
	pub fn layout(&self) -> &CacheLayout {
		&self.layout
	}

	/// Checks that `fork` names a valid fork with a rule, without touching disk.
	///
	/// # Errors
	///
	/// Returns a configuration error for invalid names, unknown forks and alias
	/// chains exceeding the hop limit.
	pub fn check(&self, fork: &str) -> Result<(), ResolveError> {
		self.concrete(fork).map(|_| ())
	}

	fn concrete<'a>(&'a self, fork: &'a str) -> Result<(&'a str, ConcreteRule<'a>), ResolveError> {
		validate_fork_name(fork)?;
		let (owner, rule) = self.table.concrete(fork, self.config.max_alias_hops)?;
		validate_fork_name(owner)?;
		Ok((owner, rule))
	}

	/// Returns a directory holding the code for `fork`, fetching it if needed.
	///
	/// # Errors
	///
	/// Returns a [`ResolveError`] for configuration problems, missing local
	/// paths, and git or filesystem failures. A failed refresh never falls back
	/// to an outdated snapshot.
	pub fn resolve(&self, fork: &str) -> Result<ResolvedFork, ResolveError> {
		let (owner, rule) = self.concrete(fork)?;
		let path = match rule {
			ConcreteRule::Local(local) => {
				if !local.path.exists() {
					return Err(ResolveError::MissingLocalPath {
						fork: owner.to_string(),
						path: local.path.clone(),
					});
				}
				local.path.clone()
			}
			ConcreteRule::Git(git) => self.resolve_git(fork, git)?,
		};

		tracing::debug!(%fork, source_fork = %owner, path = %path.display(), "fork resolved");
		Ok(ResolvedFork {
			source_fork: owner.to_string(),
			path,
		})
	}

	fn resolve_git(&self, fork: &str, rule: &GitResolution) -> Result<PathBuf, ResolveError> {
		self.layout.ensure_root()?;
		let _lock = ForkLock::acquire(self.layout.lock_path(fork))?;
		let dir = self.layout.snapshot_dir(fork);

		if let Some(mut entry) = self.layout.read_entry(fork)
			&& entry.resolution == *rule
			&& dir.is_dir()
		{
			if entry.is_fresh(rule, self.config.revalidate_after, Utc::now()) {
				tracing::debug!(%fork, head = %entry.head, "reusing cached snapshot");
				return Ok(dir);
			}

			let remote = match self.source.remote_head(rule) {
				Ok(remote) => remote,
				Err(e) => {
					self.discard(fork);
					return Err(e);
				}
			};
			if remote == entry.head {
				tracing::debug!(%fork, head = %entry.head, "remote unchanged, reusing cached snapshot");
				entry.timestamp = Utc::now();
				self.layout.write_entry(fork, &entry)?;
				return Ok(dir);
			}
			tracing::info!(%fork, cached = %entry.head, %remote, "remote moved, refreshing snapshot");
		}

		self.materialize(fork, rule, &dir)?;
		Ok(dir)
	}

	/// Drops the entry and snapshot of `fork` after a failed revalidation.
	/// Must be called with the fork lock held.
	fn discard(&self, fork: &str) {
		if let Err(e) = self.layout.remove_entry(fork) {
			tracing::warn!(%fork, error = %e, "failed to remove cache entry");
		}
		if let Err(e) = self.layout.remove_snapshot(fork) {
			tracing::warn!(%fork, error = %e, "failed to remove snapshot");
		}
	}

	/// Replaces the snapshot of `fork`. Must be called with the fork lock held.
	fn materialize(&self, fork: &str, rule: &GitResolution, dir: &Path) -> Result<(), ResolveError> {
		self.layout.remove_entry(fork)?;
		self.layout.remove_snapshot(fork)?;

		let head = match self.source.fetch(rule, dir) {
			Ok(head) => head,
			Err(e) => {
				if let Err(cleanup) = self.layout.remove_snapshot(fork) {
					tracing::warn!(%fork, error = %cleanup, "failed to remove partial snapshot");
				}
				return Err(e);
			}
		};

		let git_dir = dir.join(".git");
		match std::fs::remove_dir_all(&git_dir) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(ResolveError::io(git_dir, e)),
		}

		self.layout.write_entry(fork, &CacheEntry::new(rule.clone(), head.clone()))?;
		tracing::info!(%fork, %head, path = %dir.display(), "snapshot materialized");
		Ok(())
	}

	/// Describes where the code for `fork` comes from, without network access.
	///
	/// Git rules yield `git-url`, `branch` and, once known, `commit`; local rules
	/// yield `path`.
	///
	/// # Errors
	///
	/// Returns a configuration error if `fork` cannot be looked up.
	pub fn describe(&self, fork: &str) -> Result<Value, ResolveError> {
		let (_, rule) = self.concrete(fork)?;
		let info = match rule {
			ConcreteRule::Local(local) => json!({ "path": local.path }),
			ConcreteRule::Git(git) => {
				let mut info = Map::new();
				info.insert("git-url".into(), json!(git.git_url.as_str()));
				info.insert("branch".into(), json!(git.branch));
				let commit = git.commit.clone().or_else(|| {
					self.layout
						.read_entry(fork)
						.filter(|entry| entry.resolution == *git)
						.map(|entry| entry.head)
				});
				if let Some(commit) = commit {
					info.insert("commit".into(), json!(commit));
				}
				Value::Object(info)
			}
		};
		Ok(info)
	}

	/// Drops the cache entry for `fork` so the next [`resolve`](Self::resolve)
	/// fetches again.
	///
	/// Returns false for local rules, which have nothing cached.
	///
	/// # Errors
	///
	/// Returns a [`ResolveError`] for configuration problems or if the entry
	/// cannot be removed.
	pub fn invalidate(&self, fork: &str) -> Result<bool, ResolveError> {
		let (owner, rule) = self.concrete(fork)?;
		match rule {
			ConcreteRule::Local(_) => Ok(false),
			ConcreteRule::Git(_) => {
				self.layout.ensure_root()?;
				let _lock = ForkLock::acquire(self.layout.lock_path(fork))?;
				self.layout.remove_entry(fork)?;
				tracing::info!(%fork, source_fork = %owner, "cache entry invalidated");
				Ok(true)
			}
		}
	}
}
