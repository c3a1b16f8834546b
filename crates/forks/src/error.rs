//! Error types for fork configuration and resolution.

use std::path::PathBuf;

use thiserror::Error;

/// Errors in the fork configuration itself.
///
/// These are never retried: they mean the operator or caller asked for
/// something the configuration cannot satisfy.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// No rule is configured for the fork.
	#[error("unable to resolve fork: {0}")]
	UnknownFork(String),

	/// The fork name cannot be used as a cache or socket file name.
	#[error("invalid fork name {name:?}: {reason}")]
	InvalidForkName {
		/// The rejected name.
		name: String,
		/// Why it was rejected.
		reason: &'static str,
	},

	/// Both the inline and the file override sources were supplied.
	#[error("only one of EELS_RESOLUTIONS and EELS_RESOLUTIONS_FILE may be set")]
	ConflictingOverrides,

	/// The override table could not be parsed.
	#[error("invalid resolution overrides: {0}")]
	InvalidOverrides(#[from] serde_json::Error),

	/// The override file could not be read.
	#[error("failed to read resolution overrides from {path}: {error}")]
	OverrideFile {
		/// Path of the override file.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// An alias chain did not reach a concrete rule within the hop limit.
	#[error("\"same_as\" hop counter exceeded while resolving fork {0}")]
	AliasHopsExceeded(String),
}

/// Errors raised while materializing a fork.
#[derive(Debug, Error)]
pub enum ResolveError {
	/// The fork configuration is unusable.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// A local rule points at a directory that does not exist.
	#[error("path {path} specified for fork '{fork}' does not exist")]
	MissingLocalPath {
		/// Fork whose rule names the path.
		fork: String,
		/// The missing path.
		path: PathBuf,
	},

	/// A git operation failed.
	#[error("git {operation} failed for {url}: {message}")]
	Git {
		/// Short name of the git operation (`clone`, `ls-remote`, ...).
		operation: &'static str,
		/// Remote the operation targeted.
		url: String,
		/// Captured stderr or spawn error.
		message: String,
	},

	/// The remote does not advertise the requested branch or tag.
	#[error("remote {url} has no reference named {reference}")]
	MissingRemoteRef {
		/// Remote URL.
		url: String,
		/// The branch or tag that was requested.
		reference: String,
	},

	/// Filesystem operation on the cache failed.
	#[error("I/O error on {path}: {error}")]
	Io {
		/// Path being operated on.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},
}

impl ResolveError {
	pub(crate) fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			error,
		}
	}

	/// Returns true if the error is a configuration problem rather than a
	/// transient or environmental failure.
	pub fn is_config(&self) -> bool {
		matches!(self, Self::Config(_))
	}
}
