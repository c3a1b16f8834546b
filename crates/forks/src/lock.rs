//! Cross-process per-fork locks.
//!
//! Independent resolver processes (several daemons, or a daemon and a direct
//! `t8n` invocation) may race to materialize the same fork. Every mutation of a
//! fork's cache happens while holding an exclusive `flock` on `<fork>.lock`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::ResolveError;

/// Exclusive lock on one fork's cache files, released on drop.
#[derive(Debug)]
pub struct ForkLock {
	file: File,
	path: PathBuf,
}

impl ForkLock {
	/// Blocks until the lock at `path` is held exclusively.
	///
	/// # Errors
	///
	/// Returns [`ResolveError::Io`] if the lock file cannot be opened or locked.
	pub fn acquire(path: impl AsRef<Path>) -> Result<Self, ResolveError> {
		let path = path.as_ref();
		let file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(false)
			.open(path)
			.map_err(|e| ResolveError::io(path, e))?;

		file.lock_exclusive().map_err(|e| ResolveError::io(path, e))?;
		tracing::trace!(path = %path.display(), "fork lock acquired");

		Ok(Self {
			file,
			path: path.to_path_buf(),
		})
	}

	/// Path of the lock file.
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for ForkLock {
	fn drop(&mut self) {
		if let Err(e) = FileExt::unlock(&self.file) {
			tracing::warn!(path = %self.path.display(), error = %e, "failed to release fork lock");
		}
	}
}
