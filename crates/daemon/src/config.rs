//! Daemon settings.
//!
//! All fields have defaults, so an empty TOML file is valid. Durations are
//! written in (fractional) seconds:
//!
//! ```toml
//! idle_timeout = 60
//! connect_timeout = 60
//!
//! [startup]
//! initial = 0.1
//! ceiling = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use eels_forks::APP_DIR_NAME;
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Tunables of the routing daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
	/// Shut down after this long without a completed request.
	#[serde(with = "secs")]
	pub idle_timeout: Duration,
	/// How often the idle reaper looks at the activity clock.
	#[serde(with = "secs")]
	pub idle_check_interval: Duration,
	/// Limit for connecting to a ready worker.
	#[serde(with = "secs")]
	pub connect_timeout: Duration,
	/// Relay timeout for requests without a `timeout` field.
	#[serde(with = "secs")]
	pub default_request_timeout: Duration,
	/// Time between SIGTERM and SIGKILL when stopping workers.
	#[serde(with = "secs")]
	pub shutdown_grace: Duration,
	/// Attach `_info_metadata.eels-resolution` to relayed JSON objects.
	pub provenance: bool,
	/// Directory for worker sockets; see [`DaemonSettings::runtime_dir`].
	pub runtime_dir: Option<PathBuf>,
	/// Worker readiness polling.
	pub startup: StartupBackoff,
}

impl Default for DaemonSettings {
	fn default() -> Self {
		Self {
			idle_timeout: Duration::from_secs(60),
			idle_check_interval: Duration::from_secs(11),
			connect_timeout: Duration::from_secs(60),
			default_request_timeout: Duration::from_secs(300),
			shutdown_grace: Duration::from_secs(1),
			provenance: true,
			runtime_dir: None,
			startup: StartupBackoff::default(),
		}
	}
}

impl DaemonSettings {
	/// Parses settings from TOML text.
	///
	/// # Errors
	///
	/// Returns [`SettingsError::Parse`] for malformed TOML, unknown keys or
	/// negative durations.
	pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
		Ok(toml::from_str(text)?)
	}

	/// Reads settings from a TOML file.
	///
	/// # Errors
	///
	/// Returns a [`SettingsError`] if the file cannot be read or parsed.
	pub fn load(path: &Path) -> Result<Self, SettingsError> {
		let text = std::fs::read_to_string(path).map_err(|error| SettingsError::Read {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&text)
	}

	/// Directory holding worker sockets.
	///
	/// Uses the configured directory, else the user runtime directory, else the
	/// temp directory, joined with the application name.
	pub fn runtime_dir(&self) -> PathBuf {
		self.runtime_dir.clone().unwrap_or_else(|| {
			dirs::runtime_dir()
				.unwrap_or_else(std::env::temp_dir)
				.join(APP_DIR_NAME)
		})
	}
}

/// Exponential backoff used while waiting for a worker to come up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartupBackoff {
	/// First wait.
	#[serde(with = "secs")]
	pub initial: Duration,
	/// Multiplier applied after every wait.
	pub factor: u32,
	/// Startup fails once the next single wait would exceed this.
	#[serde(with = "secs")]
	pub ceiling: Duration,
	/// Limit for one liveness probe.
	#[serde(with = "secs")]
	pub probe_timeout: Duration,
}

impl Default for StartupBackoff {
	fn default() -> Self {
		Self {
			initial: Duration::from_millis(100),
			factor: 2,
			ceiling: Duration::from_secs(100),
			probe_timeout: Duration::from_secs(5),
		}
	}
}

impl StartupBackoff {
	/// Returns the wait after `current`, or `None` once it exceeds the ceiling.
	pub fn next(&self, current: Duration) -> Option<Duration> {
		let next = current.saturating_mul(self.factor.max(1));
		(next <= self.ceiling).then_some(next)
	}
}

/// Serde helper for [`Duration`] as fractional seconds.
mod secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		duration.as_secs_f64().serialize(serializer)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let secs = f64::deserialize(deserializer)?;
		Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
	}
}
