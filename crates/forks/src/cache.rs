//! On-disk layout of the snapshot cache.
//!
//! ```text
//! <root>/<fork>/        snapshot without .git
//! <root>/<fork>.info    CacheEntry as JSON
//! <root>/<fork>.lock    ForkLock target
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResolveError;
use crate::resolution::GitResolution;

/// How far ahead of the caller's clock an entry may be and still count as fresh.
const CLOCK_SKEW: Duration = Duration::from_secs(1);

/// Record of a completed git materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
	/// Rule that produced the snapshot.
	pub resolution: GitResolution,
	/// When the snapshot was fetched or last confirmed against the remote.
	pub timestamp: DateTime<Utc>,
	/// Commit actually checked out.
	pub head: String,
}

impl CacheEntry {
	/// Creates an entry stamped with the current time.
	pub fn new(resolution: GitResolution, head: impl Into<String>) -> Self {
		Self {
			resolution,
			timestamp: Utc::now(),
			head: head.into(),
		}
	}

	/// Returns true if the entry was written by the same rule and needs no
	/// remote check: the rule is pinned, or the entry is younger than `window`.
	pub fn is_fresh(&self, rule: &GitResolution, window: Duration, now: DateTime<Utc>) -> bool {
		if self.resolution != *rule {
			return false;
		}
		if rule.is_pinned() {
			return true;
		}
		let age = now.signed_duration_since(self.timestamp);
		match age.to_std() {
			Ok(age) => age < window,
			// Stamped after `now` was read; anything further ahead is stale.
			Err(_) => (-age).to_std().is_ok_and(|ahead| ahead <= CLOCK_SKEW),
		}
	}
}

/// Paths of one cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
	root: PathBuf,
}

impl CacheLayout {
	/// Uses `root` as the cache directory.
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	/// The cache directory.
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Directory holding the snapshot of `fork`.
	pub fn snapshot_dir(&self, fork: &str) -> PathBuf {
		self.root.join(fork)
	}

	/// JSON record of the snapshot of `fork`.
	pub fn info_path(&self, fork: &str) -> PathBuf {
		self.root.join(format!("{fork}.info"))
	}

	/// Lock file serializing cache mutations for `fork`.
	pub fn lock_path(&self, fork: &str) -> PathBuf {
		self.root.join(format!("{fork}.lock"))
	}

	/// Creates the cache directory if needed.
	///
	/// # Errors
	///
	/// Returns [`ResolveError::Io`] if the directory cannot be created.
	pub fn ensure_root(&self) -> Result<(), ResolveError> {
		std::fs::create_dir_all(&self.root).map_err(|e| ResolveError::io(&self.root, e))
	}

	/// Reads the entry for `fork`.
	///
	/// A missing or undecodable record reads as `None`; the next resolution
	/// rebuilds it.
	pub fn read_entry(&self, fork: &str) -> Option<CacheEntry> {
		let path = self.info_path(fork);
		let text = match std::fs::read_to_string(&path) {
			Ok(text) => text,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
			Err(e) => {
				tracing::warn!(path = %path.display(), error = %e, "unreadable cache entry");
				return None;
			}
		};
		match serde_json::from_str(&text) {
			Ok(entry) => Some(entry),
			Err(e) => {
				tracing::warn!(path = %path.display(), error = %e, "discarding malformed cache entry");
				None
			}
		}
	}

	/// Atomically replaces the entry for `fork`.
	///
	/// The record is written to a temporary file in the cache root and renamed
	/// into place, so readers see either the old or the new entry.
	///
	/// # Errors
	///
	/// Returns [`ResolveError::Io`] on any filesystem failure.
	pub fn write_entry(&self, fork: &str, entry: &CacheEntry) -> Result<(), ResolveError> {
		let path = self.info_path(fork);
		let json = serde_json::to_vec(entry).map_err(|e| ResolveError::io(&path, e.into()))?;

		let mut tmp = tempfile::NamedTempFile::new_in(&self.root).map_err(|e| ResolveError::io(&self.root, e))?;
		tmp.write_all(&json).map_err(|e| ResolveError::io(tmp.path(), e))?;
		tmp.as_file().sync_all().map_err(|e| ResolveError::io(tmp.path(), e))?;
		tmp.persist(&path).map_err(|e| ResolveError::io(&path, e.error))?;
		Ok(())
	}

	/// Removes the entry for `fork`, if any.
	///
	/// # Errors
	///
	/// Returns [`ResolveError::Io`] for failures other than the file being absent.
	pub fn remove_entry(&self, fork: &str) -> Result<(), ResolveError> {
		let path = self.info_path(fork);
		match std::fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(ResolveError::io(path, e)),
		}
	}

	/// Deletes the snapshot directory of `fork`, if any.
	///
	/// # Errors
	///
	/// Returns [`ResolveError::Io`] for failures other than the directory being absent.
	pub fn remove_snapshot(&self, fork: &str) -> Result<(), ResolveError> {
		let dir = self.snapshot_dir(fork);
		match std::fs::remove_dir_all(&dir) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(ResolveError::io(dir, e)),
		}
	}
}
