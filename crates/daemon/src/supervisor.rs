//! Worker lifecycle: one worker process per fork.
//!
//! Each fork owns a slot behind an async mutex. Holding the slot (a
//! [`WorkerLease`]) serializes requests for one fork while other forks proceed
//! concurrently, and guarantees a worker is spawned at most once even when the
//! first requests for a fork arrive together.

use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::StartupBackoff;
use crate::error::DaemonError;
use crate::http;
use crate::launcher::{WorkerLauncher, WorkerProcess, WorkerSpec};


#[derive(Debug, Default)]
struct Slot {
	worker: Option<WorkerState>,
}

#[derive(Debug)]
struct WorkerState {
	socket: PathBuf,
	ready: bool,
}

#[derive(Debug, Default)]
struct ProcessTable {
	/// Set by [`Supervisor::terminate_all`]; no worker is recorded afterwards.
	closed: bool,
	workers: HashMap<String, WorkerProcess>,
}

/// Exclusive use of a ready worker.
///
/// The fork's slot stays locked until the lease is dropped.
#[derive(Debug)]
pub struct WorkerLease {
	fork: String,
	socket: PathBuf,
	_slot: OwnedMutexGuard<Slot>,
}

impl WorkerLease {
	/// Fork the worker serves.
	pub fn fork(&self) -> &str {
		&self.fork
	}

	/// Socket the worker listens on.
	pub fn socket(&self) -> &Path {
		&self.socket
	}
}

/// Owns the worker processes of one daemon.
pub struct Supervisor {
	runtime_dir: PathBuf,
	daemon_pid: u32,
	launcher: Arc<dyn WorkerLauncher>,
	startup: StartupBackoff,
	slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Slot>>>>,
	processes: Mutex<ProcessTable>,
}

impl std::fmt::Debug for Supervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Supervisor")
			.field("runtime_dir", &self.runtime_dir)
			.field("workers", &self.processes.lock().workers.len())
			.finish_non_exhaustive()
	}
}

impl Supervisor {
	/// Creates a supervisor placing worker sockets in `runtime_dir`.
	pub fn new(runtime_dir: impl Into<PathBuf>, launcher: Arc<dyn WorkerLauncher>, startup: StartupBackoff) -> Self {
		Self {
			runtime_dir: runtime_dir.into(),
			daemon_pid: std::process::id(),
			launcher,
			startup,
			slots: Mutex::new(HashMap::new()),
			processes: Mutex::new(ProcessTable::default()),
		}
	}

	/// Socket path of the worker for `fork`: `<runtime-dir>/<fork>.<daemon-pid>.sock`.
	pub fn socket_path(&self, fork: &str) -> PathBuf {
		self.runtime_dir.join(format!("{fork}.{}.sock", self.daemon_pid))
	}

	/// Number of worker processes currently recorded.
	pub fn worker_count(&self) -> usize {
		self.processes.lock().workers.len()
	}

	fn slot(&self, fork: &str) -> Arc<tokio::sync::Mutex<Slot>> {
		self.slots.lock().entry(fork.to_string()).or_default().clone()
	}

	/// Returns a lease on a ready worker for `fork`, spawning one if needed.
	///
	/// A worker that exited since its last use is replaced. A worker that timed
	/// out during startup stays recorded and is awaited again instead of being
	/// respawned.
	///
	/// # Errors
	///
	/// - [`DaemonError::Spawn`] if the worker cannot be started.
	/// - [`DaemonError::WorkerExited`] if it exits before becoming ready; the slot
	///   is cleared so the next call spawns a fresh worker.
	/// - [`DaemonError::StartupTimeout`] if it does not become ready in time.
	/// - [`DaemonError::ShuttingDown`] once [`Supervisor::terminate_all`] has run.
	pub async fn ensure_worker(&self, fork: &str) -> Result<WorkerLease, DaemonError> {
		let mut slot = self.slot(fork).lock_owned().await;

		if slot.worker.is_some()
			&& let Some(status) = self.exit_status(fork)
		{
			tracing::warn!(%fork, %status, "worker exited, replacing it");
			self.discard(fork, &mut slot);
		}

		let recorded = slot.worker.as_ref().map(|worker| worker.socket.clone());
		let socket = match recorded {
			Some(socket) => socket,
			None => {
				let socket = self.spawn(fork).await?;
				slot.worker = Some(WorkerState {
					socket: socket.clone(),
					ready: false,
				});
				socket
			}
		};

		if slot.worker.as_ref().is_some_and(|worker| !worker.ready) {
			match self.wait_ready(fork, &socket).await {
				Ok(()) => {
					if let Some(worker) = slot.worker.as_mut() {
						worker.ready = true;
					}
					tracing::info!(%fork, socket = %socket.display(), "worker ready");
				}
				Err(e @ DaemonError::WorkerExited { .. }) => {
					self.discard(fork, &mut slot);
					return Err(e);
				}
				Err(e) => return Err(e),
			}
		}

		Ok(WorkerLease {
			fork: fork.to_string(),
			socket,
			_slot: slot,
		})
	}

	async fn spawn(&self, fork: &str) -> Result<PathBuf, DaemonError> {
		if self.processes.lock().closed {
			return Err(DaemonError::ShuttingDown { fork: fork.to_string() });
		}

		std::fs::DirBuilder::new()
			.recursive(true)
			.mode(0o700)
			.create(&self.runtime_dir)
			.map_err(|error| DaemonError::Io {
				path: self.runtime_dir.clone(),
				error,
			})?;

		let socket = self.socket_path(fork);
		remove_socket(&socket).map_err(|error| DaemonError::Io {
			path: socket.clone(),
			error,
		})?;

		let spec = WorkerSpec {
			fork: fork.to_string(),
			socket: socket.clone(),
		};
		let process = self.launcher.launch(&spec).await.map_err(|error| DaemonError::Spawn {
			fork: fork.to_string(),
			error,
		})?;

		tracing::debug!(%fork, pid = ?process.pid(), socket = %socket.display(), "worker starting");
		let rejected = {
			let mut table = self.processes.lock();
			if table.closed {
				Some(process)
			} else {
				table.workers.insert(fork.to_string(), process);
				None
			}
		};
		if let Some(process) = rejected {
			tracing::debug!(%fork, "shutdown began during launch, stopping worker");
			process.terminate(Duration::ZERO).await;
			if let Err(e) = remove_socket(&socket) {
				tracing::debug!(%fork, error = %e, "failed to remove worker socket");
			}
			return Err(DaemonError::ShuttingDown { fork: fork.to_string() });
		}
		Ok(socket)
	}

	/// Two-phase readiness: wait for the socket file, then for any HTTP answer.
	async fn wait_ready(&self, fork: &str, socket: &Path) -> Result<(), DaemonError> {
		let started = Instant::now();
		let mut wait = self.startup.initial;
		let timed_out = || DaemonError::StartupTimeout {
			fork: fork.to_string(),
			waited: started.elapsed(),
		};

		while !socket.exists() {
			self.check_alive(fork)?;
			tracing::trace!(%fork, ?wait, "waiting for worker socket");
			tokio::time::sleep(wait).await;
			wait = self.startup.next(wait).ok_or_else(timed_out)?;
		}

		while !http::probe(socket, self.startup.probe_timeout).await {
			self.check_alive(fork)?;
			tracing::trace!(%fork, ?wait, "waiting for worker heartbeat");
			tokio::time::sleep(wait).await;
			wait = self.startup.next(wait).ok_or_else(timed_out)?;
		}
		Ok(())
	}

	fn check_alive(&self, fork: &str) -> Result<(), DaemonError> {
		match self.exit_status(fork) {
			Some(status) => Err(DaemonError::WorkerExited {
				fork: fork.to_string(),
				status,
			}),
			None => Ok(()),
		}
	}

	fn exit_status(&self, fork: &str) -> Option<String> {
		match self.processes.lock().workers.get_mut(fork) {
			Some(process) => process.exit_status(),
			None => Some("not running".to_string()),
		}
	}

	fn discard(&self, fork: &str, slot: &mut Slot) {
		self.processes.lock().workers.remove(fork);
		if let Some(worker) = slot.worker.take()
			&& let Err(e) = remove_socket(&worker.socket)
		{
			tracing::debug!(%fork, error = %e, "failed to remove worker socket");
		}
	}

	/// Stops every worker: SIGTERM, then SIGKILL after `grace`. Socket files are
	/// removed afterwards.
	///
	/// The supervisor is closed from then on: later requests get
	/// [`DaemonError::ShuttingDown`] instead of a new worker.
	pub async fn terminate_all(&self, grace: Duration) {
		let processes: Vec<(String, WorkerProcess)> = {
			let mut table = self.processes.lock();
			table.closed = true;
			table.workers.drain().collect()
		};
		if processes.is_empty() {
			return;
		}
		tracing::info!(count = processes.len(), "terminating workers");

		let mut stopping = JoinSet::new();
		for (fork, process) in processes {
			stopping.spawn(async move {
				process.terminate(grace).await;
				fork
			});
		}
		while let Some(result) = stopping.join_next().await {
			match result {
				Ok(fork) => {
					tracing::debug!(%fork, "worker stopped");
					if let Err(e) = remove_socket(&self.socket_path(&fork)) {
						tracing::debug!(%fork, error = %e, "failed to remove worker socket");
					}
				}
				Err(e) => tracing::warn!(error = %e, "worker termination task failed"),
			}
		}
	}
}

fn remove_socket(path: &Path) -> std::io::Result<()> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e),
	}
}
