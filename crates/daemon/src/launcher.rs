//! Worker launcher abstraction for production and testing.

use std::ffi::OsString;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

/// What a worker is started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
	/// Fork the worker serves.
	pub fork: String,
	/// Socket the worker must listen on.
	pub socket: PathBuf,
}

/// Future returned by [`WorkerLauncher::launch`].
pub type LaunchFuture = Pin<Box<dyn Future<Output = std::io::Result<WorkerProcess>> + Send>>;

/// Starts worker processes.
///
/// The supervisor uses real subprocesses in production and in-process fake
/// workers in tests.
pub trait WorkerLauncher: Send + Sync + 'static {
	/// Starts a worker for `spec`. Returning does not mean the worker is ready;
	/// the supervisor polls the socket afterwards.
	fn launch(&self, spec: &WorkerSpec) -> LaunchFuture;
}

/// Production launcher that re-executes a resolver binary in worker mode.
///
/// Runs `<program> spawn-daemon --state.fork <fork> --uds <socket> --timeout=0`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	program: PathBuf,
	envs: Vec<(OsString, OsString)>,
	removed: Vec<OsString>,
}

impl ProcessLauncher {
	/// Launches workers through `program`.
	#[must_use]
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			envs: Vec::new(),
			removed: Vec::new(),
		}
	}

	/// Launches workers through the running executable.
	///
	/// # Errors
	///
	/// Returns an error if the path of the running executable is unknown.
	pub fn current_exe() -> std::io::Result<Self> {
		Ok(Self::new(std::env::current_exe()?))
	}

	/// Sets an environment variable for every worker.
	#[must_use]
	pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
		self.envs.push((key.into(), value.into()));
		self
	}

	/// Clears an inherited environment variable for every worker.
	#[must_use]
	pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
		self.removed.push(key.into());
		self
	}
}

impl WorkerLauncher for ProcessLauncher {
	fn launch(&self, spec: &WorkerSpec) -> LaunchFuture {
		let mut command = tokio::process::Command::new(&self.program);
		for key in &self.removed {
			command.env_remove(key);
		}
		command
			.arg("spawn-daemon")
			.arg("--state.fork")
			.arg(&spec.fork)
			.arg("--uds")
			.arg(&spec.socket)
			.arg("--timeout=0")
			.envs(self.envs.iter().cloned())
			.stdin(Stdio::null())
			.stdout(Stdio::inherit())
			.stderr(Stdio::inherit())
			.kill_on_drop(true);

		let fork = spec.fork.clone();
		Box::pin(async move {
			let child = command.spawn().inspect_err(|e| {
				tracing::error!(%fork, error = %e, "failed to spawn worker");
			})?;
			tracing::info!(%fork, pid = ?child.id(), "worker spawned");
			Ok(WorkerProcess::real(child))
		})
	}
}

/// Handle to a running worker.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChildHandle {
	/// Real spawned process.
	Real(tokio::process::Child),
	/// Worker running as a task inside this process.
	InProcess {
		/// The worker task.
		task: tokio::task::JoinHandle<()>,
		/// Cancelled to ask the task to stop.
		stop: CancellationToken,
	},
}

/// A worker owned by the supervisor's process table.
#[derive(Debug)]
pub struct WorkerProcess {
	handle: ChildHandle,
}

impl WorkerProcess {
	/// Wraps a spawned child process.
	pub fn real(child: tokio::process::Child) -> Self {
		Self {
			handle: ChildHandle::Real(child),
		}
	}

	/// Wraps an in-process worker task.
	pub fn in_process(task: tokio::task::JoinHandle<()>, stop: CancellationToken) -> Self {
		Self {
			handle: ChildHandle::InProcess { task, stop },
		}
	}

	/// OS process id, if this is a live subprocess.
	pub fn pid(&self) -> Option<u32> {
		match &self.handle {
			ChildHandle::Real(child) => child.id(),
			ChildHandle::InProcess { .. } => None,
		}
	}

	/// Returns a description of the exit status once the worker has exited.
	pub fn exit_status(&mut self) -> Option<String> {
		match &mut self.handle {
			ChildHandle::Real(child) => match child.try_wait() {
				Ok(Some(status)) => Some(status.to_string()),
				Ok(None) => None,
				Err(e) => Some(format!("wait failed: {e}")),
			},
			ChildHandle::InProcess { task, .. } => task.is_finished().then(|| "worker task finished".to_string()),
		}
	}

	/// Cancels an in-process worker without waiting for it.
	#[cfg(test)]
	pub(crate) fn request_stop(&self) {
		if let ChildHandle::InProcess { stop, .. } = &self.handle {
			stop.cancel();
		}
	}

	/// Asks the worker to stop, and kills it if it is still running after `grace`.
	pub async fn terminate(self, grace: Duration) {
		match self.handle {
			ChildHandle::Real(mut child) => {
				if let Some(pid) = child.id() {
					match i32::try_from(pid).map(Pid::from_raw) {
						Ok(pid) => match kill(pid, Signal::SIGTERM) {
							Ok(()) | Err(Errno::ESRCH) => {}
							Err(e) => tracing::warn!(?pid, error = %e, "failed to signal worker"),
						},
						Err(_) => tracing::warn!(pid, "worker pid out of range"),
					}
				}
				if tokio::time::timeout(grace, child.wait()).await.is_err() {
					tracing::warn!(pid = ?child.id(), "worker ignored SIGTERM, killing");
					if let Err(e) = child.kill().await {
						tracing::warn!(error = %e, "failed to kill worker");
					}
				}
			}
			ChildHandle::InProcess { mut task, stop } => {
				stop.cancel();
				if tokio::time::timeout(grace, &mut task).await.is_err() {
					task.abort();
				}
			}
		}
	}
}
