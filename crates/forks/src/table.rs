//! The effective table of resolution rules.

use std::collections::HashMap;
use std::path::PathBuf;

use url::Url;

use crate::error::ConfigError;
use crate::resolution::{GitResolution, LocalResolution, Resolution, SameAsResolution};

/// Environment variable holding an inline JSON override table.
pub const RESOLUTIONS_ENV: &str = "EELS_RESOLUTIONS";
/// Environment variable holding the path of a JSON override table.
pub const RESOLUTIONS_FILE_ENV: &str = "EELS_RESOLUTIONS_FILE";

const EXECUTION_SPECS_URL: &str = "https://github.com/ethereum/execution-specs.git";

/// Forks that track the main development branch by default.
const MASTER_ALIASES: &[&str] = &[
	"Frontier",
	"Homestead",
	"EIP150",
	"EIP158",
	"Byzantium",
	"ConstantinopleFix",
	"Istanbul",
	"Berlin",
	"London",
	"Merge",
	"Shanghai",
	"Cancun",
];

/// Where caller-supplied overrides come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OverrideSource {
	/// Built-in defaults only.
	#[default]
	None,
	/// A JSON object given inline.
	Inline(String),
	/// Path to a file containing a JSON object.
	File(PathBuf),
}

impl OverrideSource {
	/// Builds a source from the two mutually exclusive inputs.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::ConflictingOverrides`] if both are present.
	pub fn from_parts(inline: Option<String>, file: Option<PathBuf>) -> Result<Self, ConfigError> {
		match (inline, file) {
			(Some(_), Some(_)) => Err(ConfigError::ConflictingOverrides),
			(Some(json), None) => Ok(Self::Inline(json)),
			(None, Some(path)) => Ok(Self::File(path)),
			(None, None) => Ok(Self::None),
		}
	}

	/// Reads `EELS_RESOLUTIONS` and `EELS_RESOLUTIONS_FILE`.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::ConflictingOverrides`] if both are set.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_parts(
			std::env::var(RESOLUTIONS_ENV).ok(),
			std::env::var_os(RESOLUTIONS_FILE_ENV).map(PathBuf::from),
		)
	}

	fn load(&self) -> Result<HashMap<String, Resolution>, ConfigError> {
		match self {
			Self::None => Ok(HashMap::new()),
			Self::Inline(json) => Ok(serde_json::from_str(json)?),
			Self::File(path) => {
				let text = std::fs::read_to_string(path).map_err(|error| ConfigError::OverrideFile {
					path: path.clone(),
					error,
				})?;
				Ok(serde_json::from_str(&text)?)
			}
		}
	}
}

/// A rule that names code directly rather than through an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcreteRule<'a> {
	/// See [`Resolution::Local`].
	Local(&'a LocalResolution),
	/// See [`Resolution::Git`].
	Git(&'a GitResolution),
}

/// Immutable mapping from fork name to rule.
///
/// Built once per process; overrides replace whole entries of the defaults.
#[derive(Debug, Clone, Default)]
pub struct ResolutionTable {
	rules: HashMap<String, Resolution>,
}

impl ResolutionTable {
	/// The table shipped with the resolver.
	pub fn defaults() -> Self {
		let url = Url::parse(EXECUTION_SPECS_URL).expect("built-in execution-specs URL is valid");
		let mut rules = HashMap::new();
		rules.insert(
			"EELSMaster".to_string(),
			Resolution::Git(GitResolution::branch(url.clone(), "master")),
		);
		rules.insert(
			"Prague".to_string(),
			Resolution::Git(GitResolution::branch(url, "forks/prague")),
		);
		for fork in MASTER_ALIASES {
			rules.insert(
				(*fork).to_string(),
				Resolution::SameAs(SameAsResolution {
					same_as: "EELSMaster".to_string(),
				}),
			);
		}
		Self { rules }
	}

	/// Builds a table containing exactly `rules`.
	pub fn from_rules(rules: impl IntoIterator<Item = (String, Resolution)>) -> Self {
		Self {
			rules: rules.into_iter().collect(),
		}
	}

	/// Defaults merged with the given override source.
	///
	/// # Errors
	///
	/// Returns a [`ConfigError`] if the override source cannot be read or parsed.
	pub fn load(source: &OverrideSource) -> Result<Self, ConfigError> {
		let mut table = Self::defaults();
		let overrides = source.load()?;
		if !overrides.is_empty() {
			tracing::debug!(count = overrides.len(), "applying resolution overrides");
		}
		table.rules.extend(overrides);
		Ok(table)
	}

	/// Looks up the rule configured for `fork`.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::UnknownFork`] if there is none.
	pub fn get(&self, fork: &str) -> Result<&Resolution, ConfigError> {
		self.rules.get(fork).ok_or_else(|| ConfigError::UnknownFork(fork.to_string()))
	}

	/// Returns true if a rule exists for `fork`.
	pub fn contains(&self, fork: &str) -> bool {
		self.rules.contains_key(fork)
	}

	/// Follows aliases until a concrete rule is reached.
	///
	/// Returns the name of the fork owning the concrete rule together with the rule.
	/// At most `max_hops` aliases are followed.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::UnknownFork`] for a missing link and
	/// [`ConfigError::AliasHopsExceeded`] when the chain is longer than `max_hops`
	/// (which includes every cycle).
	pub fn concrete<'a>(&'a self, fork: &'a str, max_hops: usize) -> Result<(&'a str, ConcreteRule<'a>), ConfigError> {
		let mut name = fork;
		let mut hops_remaining = max_hops;
		loop {
			match self.get(name)? {
				Resolution::Local(local) => return Ok((name, ConcreteRule::Local(local))),
				Resolution::Git(git) => return Ok((name, ConcreteRule::Git(git))),
				Resolution::SameAs(alias) => {
					if hops_remaining == 0 {
						return Err(ConfigError::AliasHopsExceeded(fork.to_string()));
					}
					hops_remaining -= 1;
					name = &alias.same_as;
				}
			}
		}
	}

	/// Iterates over fork names in the table.
	pub fn forks(&self) -> impl Iterator<Item = &str> {
		self.rules.keys().map(String::as_str)
	}
}
