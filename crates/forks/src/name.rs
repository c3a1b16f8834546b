//! Fork name validation.

use crate::ConfigError;

/// Checks that a fork name can safely name files in the cache and runtime directories.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidForkName`] for empty names, `.`/`..`, and names
/// containing path separators or NUL.
pub fn validate_fork_name(name: &str) -> Result<(), ConfigError> {
	let reason = if name.is_empty() {
		"must not be empty"
	} else if name == "." || name == ".." {
		"must not be a relative directory reference"
	} else if name.contains(['/', '\\']) {
		"must not contain path separators"
	} else if name.contains('\0') {
		"must not contain NUL"
	} else {
		return Ok(());
	};

	Err(ConfigError::InvalidForkName {
		name: name.to_string(),
		reason,
	})
}
