//! Error types for the routing daemon.

use std::path::PathBuf;
use std::time::Duration;

use eels_forks::ResolveError;
use http::StatusCode;
use thiserror::Error;

/// Failures while routing one request to a worker.
#[derive(Debug, Error)]
pub enum DaemonError {
	/// The request body is not usable.
	#[error("bad request: {0}")]
	BadRequest(String),

	/// The fork cannot be looked up.
	#[error(transparent)]
	Resolve(#[from] ResolveError),

	/// The worker process could not be started.
	#[error("failed to spawn worker for fork {fork}: {error}")]
	Spawn {
		/// Fork the worker was meant to serve.
		fork: String,
		/// The underlying spawn error.
		error: std::io::Error,
	},

	/// The worker process exited before it became ready.
	#[error("worker for fork {fork} exited during startup: {status}")]
	WorkerExited {
		/// Fork the worker was serving.
		fork: String,
		/// Exit status as reported by the process table.
		status: String,
	},

	/// The worker did not become ready within the startup backoff ceiling.
	#[error("worker for fork {fork} not ready after {waited:?}")]
	StartupTimeout {
		/// Fork the worker is serving.
		fork: String,
		/// Total time spent waiting.
		waited: Duration,
	},

	/// The worker socket refused or did not accept the connection in time.
	#[error("failed to connect to worker for fork {fork}: {message}")]
	RelayConnect {
		/// Fork the worker is serving.
		fork: String,
		/// Description of the connection failure.
		message: String,
	},

	/// The worker did not answer within the request's timeout.
	#[error("worker for fork {fork} did not answer within {timeout:?}")]
	RelayTimeout {
		/// Fork the worker is serving.
		fork: String,
		/// Timeout that elapsed.
		timeout: Duration,
	},

	/// The HTTP exchange with the worker failed after connecting.
	#[error("relay to worker for fork {fork} failed: {message}")]
	Relay {
		/// Fork the worker is serving.
		fork: String,
		/// Description of the failure.
		message: String,
	},

	/// The daemon is shutting down and starts no more workers.
	#[error("daemon is shutting down, not starting a worker for fork {fork}")]
	ShuttingDown {
		/// Fork the request asked for.
		fork: String,
	},

	/// Filesystem operation in the runtime directory failed.
	#[error("I/O error on {path}: {error}")]
	Io {
		/// Path being operated on.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},
}

impl DaemonError {
	/// HTTP status reported to the caller for this error.
	pub fn status(&self) -> StatusCode {
		match self {
			Self::BadRequest(_) => StatusCode::BAD_REQUEST,
			Self::Resolve(e) if e.is_config() => StatusCode::BAD_REQUEST,
			Self::WorkerExited { .. } | Self::RelayConnect { .. } | Self::Relay { .. } => StatusCode::BAD_GATEWAY,
			Self::StartupTimeout { .. } | Self::RelayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
			Self::ShuttingDown { .. } => StatusCode::SERVICE_UNAVAILABLE,
			Self::Resolve(_) | Self::Spawn { .. } | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

/// Failures loading [`DaemonSettings`](crate::DaemonSettings).
#[derive(Debug, Error)]
pub enum SettingsError {
	/// The settings file could not be read.
	#[error("failed to read daemon settings from {path}: {error}")]
	Read {
		/// Path of the settings file.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// The settings file is not valid TOML for [`DaemonSettings`](crate::DaemonSettings).
	#[error("invalid daemon settings: {0}")]
	Parse(#[from] toml::de::Error),
}
