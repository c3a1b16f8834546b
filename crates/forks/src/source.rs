//! Snapshot retrieval from git remotes.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::ResolveError;
use crate::resolution::GitResolution;

/// Fetches snapshots of git references.
///
/// The resolver only needs two operations: a cheap lookup of the commit a
/// branch or tag currently points at, and a full checkout into a directory.
pub trait SnapshotSource: Send + Sync {
	/// Returns the commit `rule.branch` currently points at on the remote,
	/// without fetching any content.
	///
	/// # Errors
	///
	/// Returns a [`ResolveError`] if the remote cannot be queried or lacks the reference.
	fn remote_head(&self, rule: &GitResolution) -> Result<String, ResolveError>;

	/// Checks out `rule` into `dest` (which must not exist) and returns the
	/// commit that was checked out. The checkout may still contain `.git`.
	///
	/// # Errors
	///
	/// Returns a [`ResolveError`] if the clone or checkout fails.
	fn fetch(&self, rule: &GitResolution, dest: &Path) -> Result<String, ResolveError>;
}

/// [`SnapshotSource`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
	program: PathBuf,
}

impl GitCli {
	/// Uses the given `git` executable.
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self { program: program.into() }
	}

	/// Finds `git` on `PATH`, falling back to the bare name so spawn errors
	/// report what was attempted.
	pub fn locate() -> Self {
		let program = which::which("git").unwrap_or_else(|_| PathBuf::from("git"));
		Self { program }
	}

	fn run<I, S>(&self, operation: &'static str, url: &str, args: I) -> Result<String, ResolveError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<OsStr>,
	{
		let output = Command::new(&self.program)
			.args(args)
			.env("GIT_TERMINAL_PROMPT", "0")
			.stdin(Stdio::null())
			.output()
			.map_err(|e| ResolveError::Git {
				operation,
				url: url.to_string(),
				message: format!("failed to run {}: {e}", self.program.display()),
			})?;

		if !output.status.success() {
			return Err(ResolveError::Git {
				operation,
				url: url.to_string(),
				message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

impl Default for GitCli {
	fn default() -> Self {
		Self::locate()
	}
}

impl SnapshotSource for GitCli {
	fn remote_head(&self, rule: &GitResolution) -> Result<String, ResolveError> {
		let url = rule.git_url.as_str();
		let branch = &rule.branch;
		let heads = format!("refs/heads/{branch}");
		let tags = format!("refs/tags/{branch}");
		let peeled = format!("refs/tags/{branch}^{{}}");
		let listing = self.run("ls-remote", url, ["ls-remote", url, heads.as_str(), tags.as_str(), peeled.as_str()])?;

		pick_remote_ref(&listing, branch).ok_or_else(|| ResolveError::MissingRemoteRef {
			url: url.to_string(),
			reference: branch.clone(),
		})
	}

	fn fetch(&self, rule: &GitResolution, dest: &Path) -> Result<String, ResolveError> {
		let url = rule.git_url.as_str();
		let branch_arg = format!("--branch={}", rule.branch);
		let dest_arg = dest.as_os_str();

		let mut clone = vec![OsStr::new("clone"), OsStr::new("--quiet")];
		match &rule.commit {
			None => {
				tracing::info!(%url, branch = %rule.branch, dest = %dest.display(), "shallow clone");
				clone.push(OsStr::new("--depth=1"));
			}
			Some(commit) => {
				tracing::info!(%url, branch = %rule.branch, %commit, dest = %dest.display(), "single-branch clone");
				clone.push(OsStr::new("--single-branch"));
			}
		}
		clone.extend([OsStr::new(&branch_arg), OsStr::new("--"), OsStr::new(url), dest_arg]);
		self.run("clone", url, clone)?;

		if let Some(commit) = &rule.commit {
			let checkout = [
				OsStr::new("-C"),
				dest_arg,
				OsStr::new("-c"),
				OsStr::new("advice.detachedHead=false"),
				OsStr::new("checkout"),
				OsStr::new("--quiet"),
				OsStr::new(commit),
			];
			self.run("checkout", url, checkout)?;
		}

		let head = self.run("rev-parse", url, [OsStr::new("-C"), dest_arg, OsStr::new("rev-parse"), OsStr::new("HEAD")])?;
		Ok(head.trim().to_string())
	}
}

/// Picks the commit for `reference` out of `git ls-remote` output.
///
/// Peeled annotated tags win over the tag object, and tags over branches, so
/// the result matches what `git clone --branch` checks out.
fn pick_remote_ref(listing: &str, reference: &str) -> Option<String> {
	let wanted = [
		format!("refs/tags/{reference}^{{}}"),
		format!("refs/tags/{reference}"),
		format!("refs/heads/{reference}"),
	];
	let refs: Vec<(&str, &str)> = listing
		.lines()
		.filter_map(|line| line.split_once('\t'))
		.map(|(sha, name)| (sha.trim(), name.trim()))
		.collect();

	wanted
		.iter()
		.find_map(|name| refs.iter().find(|(_, r)| *r == name.as_str()).map(|(sha, _)| (*sha).to_string()))
}
