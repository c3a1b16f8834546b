//! Inactivity tracking and the idle reaper.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// When the last request finished, and how many are running.
#[derive(Debug)]
pub struct ActivityClock {
	last_completed: Mutex<Instant>,
	in_flight: AtomicUsize,
}

impl Default for ActivityClock {
	fn default() -> Self {
		Self::new()
	}
}

impl ActivityClock {
	/// A clock whose idle period starts now.
	pub fn new() -> Self {
		Self {
			last_completed: Mutex::new(Instant::now()),
			in_flight: AtomicUsize::new(0),
		}
	}

	/// Marks a request as running until the returned guard is dropped.
	pub fn begin(self: &Arc<Self>) -> ActivityGuard {
		self.in_flight.fetch_add(1, Ordering::SeqCst);
		ActivityGuard { clock: self.clone() }
	}

	/// Number of requests currently running.
	pub fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::SeqCst)
	}

	/// Time since the last request finished, or `None` while any is running.
	pub fn idle_for(&self, now: Instant) -> Option<Duration> {
		if self.in_flight() > 0 {
			return None;
		}
		Some(now.saturating_duration_since(*self.last_completed.lock()))
	}
}

/// Keeps a request counted as in flight.
#[derive(Debug)]
pub struct ActivityGuard {
	clock: Arc<ActivityClock>,
}

impl Drop for ActivityGuard {
	fn drop(&mut self) {
		*self.clock.last_completed.lock() = Instant::now();
		self.clock.in_flight.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Cancels `shutdown` once the daemon has been idle for longer than `idle_timeout`.
///
/// The clock is checked every `interval`; the task also ends when `shutdown`
/// is cancelled elsewhere.
pub fn spawn_reaper(
	clock: Arc<ActivityClock>,
	idle_timeout: Duration,
	interval: Duration,
	shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = tokio::time::sleep(interval) => {}
			}
			if let Some(idle) = clock.idle_for(Instant::now())
				&& idle > idle_timeout
			{
				tracing::info!(idle_secs = idle.as_secs(), "inactivity timeout reached, shutting down");
				shutdown.cancel();
				return;
			}
		}
	})
}
