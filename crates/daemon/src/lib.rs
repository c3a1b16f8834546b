//! Routing daemon for the EELS resolver.
//!
//! The daemon listens on a Unix socket for HTTP requests carrying JSON bodies,
//! reads the fork each request targets, and relays it to a worker process that
//! serves exactly that fork:
//!
//! - [`Router`]: parses requests, relays them and attaches provenance.
//! - [`Supervisor`]: one worker per fork, spawned on first use and polled until
//!   ready.
//! - [`ActivityClock`] and [`spawn_reaper`]: shut the daemon down once idle.
//! - [`serve`]: the accept loop tying everything together.

#![warn(missing_docs)]

pub mod activity;
pub mod config;
pub mod error;
pub mod http;
pub mod launcher;
pub mod router;
pub mod server;
pub mod supervisor;

pub use activity::{ActivityClock, spawn_reaper};
pub use config::{DaemonSettings, StartupBackoff};
pub use error::{DaemonError, SettingsError};
pub use launcher::{ProcessLauncher, WorkerLauncher, WorkerProcess, WorkerSpec};
pub use router::{ForwardRequest, Router};
pub use server::{Daemon, serve};
pub use supervisor::{Supervisor, WorkerLease};
