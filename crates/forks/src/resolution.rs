//! Resolution rules.
//!
//! A rule says how to obtain code for one fork. Rules are written as plain JSON
//! objects and told apart by their fields:
//!
//! ```json
//! { "path": "/home/me/execution-specs" }
//! { "same_as": "EELSMaster" }
//! { "git_url": "https://github.com/ethereum/execution-specs.git", "branch": "master" }
//! { "git_url": "https://github.com/ethereum/execution-specs.git", "tag": "v1.0", "commit": "abc123" }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

/// How to obtain the code for a fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
	/// Shallow or pinned clone of a git reference.
	Git(GitResolution),
	/// Same code as another fork.
	SameAs(SameAsResolution),
	/// A directory on the local filesystem, used as-is.
	Local(LocalResolution),
}

/// A directory owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalResolution {
	/// Root of the checkout; the importable sources live in `path/src`.
	pub path: PathBuf,
}

/// Alias of another fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SameAsResolution {
	/// Name of the fork whose rule is used instead.
	pub same_as: String,
}

/// A branch or tag of a remote git repository, optionally pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitResolution {
	/// Remote repository URL.
	pub git_url: Url,
	/// Branch or tag name.
	#[serde(alias = "tag")]
	pub branch: String,
	/// Exact commit to check out.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub commit: Option<String>,
}

impl GitResolution {
	/// Creates an unpinned rule tracking `branch`.
	pub fn branch(git_url: Url, branch: impl Into<String>) -> Self {
		Self {
			git_url,
			branch: branch.into(),
			commit: None,
		}
	}

	/// Pins the rule to an exact commit.
	#[must_use]
	pub fn pinned(mut self, commit: impl Into<String>) -> Self {
		self.commit = Some(commit.into());
		self
	}

	/// Returns true if the rule names an exact commit and can never go stale.
	pub fn is_pinned(&self) -> bool {
		self.commit.is_some()
	}
}
