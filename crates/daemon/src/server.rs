//! The master daemon: accept loop on the public socket.

use std::path::Path;
use std::sync::Arc;

use eels_forks::Resolver;
use http::{Method, Request, Response};
use hyper::body::Incoming;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::activity::{ActivityClock, spawn_reaper};
use crate::config::DaemonSettings;
use crate::http::{Body, serve_connection};
use crate::launcher::WorkerLauncher;
use crate::router::Router;
use crate::supervisor::Supervisor;

#[cfg(test)]
mod tests;

/// State shared by all connections of one daemon.
#[derive(Debug)]
pub struct Daemon {
	router: Router,
	activity: Arc<ActivityClock>,
	settings: DaemonSettings,
}

impl Daemon {
	/// Creates a daemon that starts workers through `launcher`.
	pub fn new(resolver: Arc<Resolver>, launcher: Arc<dyn WorkerLauncher>, settings: DaemonSettings) -> Arc<Self> {
		let supervisor = Arc::new(Supervisor::new(settings.runtime_dir(), launcher, settings.startup.clone()));
		Arc::new(Self {
			router: Router::new(resolver, supervisor, &settings),
			activity: Arc::new(ActivityClock::new()),
			settings,
		})
	}

	/// The worker supervisor.
	pub fn supervisor(&self) -> &Arc<Supervisor> {
		self.router.supervisor()
	}

	/// The activity clock driving the idle reaper.
	pub fn activity(&self) -> &Arc<ActivityClock> {
		&self.activity
	}

	async fn handle(&self, req: Request<Incoming>) -> Response<Body> {
		let _activity = (req.method() == Method::POST).then(|| self.activity.begin());
		self.router.handle(req).await
	}
}

/// Runs the daemon on `socket_path` until `shutdown` is cancelled or the idle
/// reaper fires.
///
/// A stale socket file is replaced. On the way out open connections get the
/// shutdown grace period to finish, then every worker is terminated and the
/// socket file is removed.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or if filesystem operations
/// on the socket path fail.
pub async fn serve(socket_path: impl AsRef<Path>, daemon: Arc<Daemon>, shutdown: CancellationToken) -> std::io::Result<()> {
	let path = socket_path.as_ref();
	if path.exists() {
		tokio::fs::remove_file(path).await?;
	}

	let listener = UnixListener::bind(path)?;
	tracing::info!(path = %path.display(), "daemon listening");

	let reaper = spawn_reaper(
		daemon.activity.clone(),
		daemon.settings.idle_timeout,
		daemon.settings.idle_check_interval,
		shutdown.clone(),
	);

	let connections = TaskTracker::new();
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				tracing::info!("daemon shutting down");
				break;
			}
			res = listener.accept() => {
				match res {
					Ok((stream, _addr)) => {
						let daemon = daemon.clone();
						connections.spawn(serve_connection(stream, move |req| {
							let daemon = daemon.clone();
							async move { daemon.handle(req).await }
						}));
					}
					Err(e) => {
						tracing::error!(error = %e, "failed to accept connection");
					}
				}
			}
		}
	}

	drop(listener);
	if let Err(e) = reaper.await {
		tracing::warn!(error = %e, "idle reaper failed");
	}

	connections.close();
	if tokio::time::timeout(daemon.settings.shutdown_grace, connections.wait()).await.is_err() {
		tracing::debug!(open = connections.len(), "connections still open at shutdown");
	}
	daemon.supervisor().terminate_all(daemon.settings.shutdown_grace).await;

	match tokio::fs::remove_file(path).await {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
		Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove daemon socket"),
	}
	tracing::info!("daemon stopped");
	Ok(())
}
