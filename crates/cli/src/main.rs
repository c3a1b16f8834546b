//! `ethereum-spec-evm-resolver` binary.
//!
//! - `daemon`: routing daemon on a Unix socket, one worker per fork.
//! - `spawn-daemon`: worker mode; resolves a fork and execs the tool's daemon.
//! - `update` / `info`: cache maintenance and inspection.
//! - anything else: resolve `--state.fork` and exec the tool with the same
//!   arguments.

mod cli;
mod tool;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Command};
use eels_daemon::{Daemon, DaemonSettings, ProcessLauncher};
use eels_forks::table::{RESOLUTIONS_ENV, RESOLUTIONS_FILE_ENV};
use eels_forks::{APP_DIR_NAME, OverrideSource, ResolutionTable, Resolver, ResolverConfig};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	setup_tracing(cli.verbose);

	let overrides = cli.override_source(
		std::env::var(RESOLUTIONS_ENV).ok(),
		std::env::var_os(RESOLUTIONS_FILE_ENV).map(PathBuf::from),
	)?;
	let table = Arc::new(ResolutionTable::load(&overrides)?);
	let resolver = Resolver::new(table, ResolverConfig::from_env());

	match cli.command {
		Command::Daemon { uds, idle_timeout } => {
			let mut settings = load_settings(cli.config.as_deref())?;
			if let Some(secs) = idle_timeout {
				settings.idle_timeout = Duration::try_from_secs_f64(secs).context("invalid --idle-timeout")?;
			}
			let launcher = worker_launcher(&overrides)?;
			tokio::runtime::Builder::new_multi_thread()
				.enable_all()
				.build()?
				.block_on(run_daemon(uds, resolver, settings, launcher))
		}
		Command::SpawnDaemon { fork, uds, timeout } => {
			let resolved = resolver.resolve(&fork)?;
			info!(%fork, path = %resolved.path.display(), "starting tool daemon");
			let mut args = vec!["daemon".into(), "--state.fork".into(), fork, "--uds".into()];
			args.push(uds.display().to_string());
			if let Some(timeout) = timeout {
				args.push(format!("--timeout={timeout}"));
			}
			Err(tool::exec(tool::command_from_env(&resolved, args)?))
		}
		Command::Update { fork } => {
			resolver.invalidate(&fork)?;
			let resolved = resolver.resolve(&fork)?;
			println!("{}", resolved.path.display());
			Ok(())
		}
		Command::Info { fork } => {
			let info = match fork {
				Some(fork) => resolver.describe(&fork)?,
				None => {
					let mut forks: Vec<_> = resolver.table().forks().collect();
					forks.sort_unstable();
					let mut all = Map::new();
					for fork in forks {
						all.insert(fork.to_string(), resolver.describe(fork)?);
					}
					Value::Object(all)
				}
			};
			println!("{}", serde_json::to_string_pretty(&info)?);
			Ok(())
		}
		Command::Tool(args) => {
			let Some(fork) = tool::fork_arg(&args) else {
				bail!("missing --state.fork");
			};
			let resolved = resolver.resolve(&fork)?;
			Err(tool::exec(tool::command_from_env(&resolved, &args)?))
		}
	}
}

async fn run_daemon(uds: PathBuf, resolver: Resolver, settings: DaemonSettings, launcher: ProcessLauncher) -> anyhow::Result<()> {
	info!("starting ethereum-spec-evm-resolver daemon");

	if let Some(parent) = uds.parent()
		&& !parent.as_os_str().is_empty()
		&& !parent.exists()
	{
		std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
	}

	info!(socket = %uds.display(), runtime_dir = %settings.runtime_dir().display(), "daemon paths");

	let shutdown = CancellationToken::new();
	tokio::spawn(cancel_on_signal(shutdown.clone()));

	let daemon = Daemon::new(Arc::new(resolver), Arc::new(launcher), settings);
	eels_daemon::serve(&uds, daemon, shutdown).await?;
	Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
	use tokio::signal::unix::{SignalKind, signal};

	let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
		(Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
		(Err(e), _) | (_, Err(e)) => {
			tracing::error!(error = %e, "failed to register signal handlers");
			return;
		}
	};

	tokio::select! {
		_ = sigterm.recv() => info!("received SIGTERM"),
		_ = sigint.recv() => info!("received SIGINT"),
		_ = shutdown.cancelled() => return,
	}
	shutdown.cancel();
}

/// Workers re-read the override table, so hand them the effective source.
fn worker_launcher(overrides: &OverrideSource) -> anyhow::Result<ProcessLauncher> {
	let launcher = ProcessLauncher::current_exe().context("cannot locate the resolver executable")?;
	Ok(match overrides {
		OverrideSource::None => launcher.env_remove(RESOLUTIONS_ENV).env_remove(RESOLUTIONS_FILE_ENV),
		OverrideSource::Inline(json) => launcher.env(RESOLUTIONS_ENV, json).env_remove(RESOLUTIONS_FILE_ENV),
		OverrideSource::File(path) => launcher.env_remove(RESOLUTIONS_ENV).env(RESOLUTIONS_FILE_ENV, path),
	})
}

fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("daemon.toml"))
}

fn load_settings(explicit: Option<&Path>) -> anyhow::Result<DaemonSettings> {
	if let Some(path) = explicit {
		return DaemonSettings::load(path).with_context(|| format!("failed to load {}", path.display()));
	}
	match default_config_path() {
		Some(path) if path.exists() => {
			DaemonSettings::load(&path).with_context(|| format!("failed to load {}", path.display()))
		}
		_ => Ok(DaemonSettings::default()),
	}
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("eels=debug,ethereum_spec_evm_resolver=debug,info")
			} else {
				EnvFilter::new("eels=info,ethereum_spec_evm_resolver=info,warn")
			}
		})
	};

	if let Some(log_dir) = std::env::var_os("EELS_LOG_DIR").map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("ethereum-spec-evm-resolver.{}.log", std::process::id()));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry().with(filter()).with(file_layer).init();

			tracing::info!(path = ?log_path, "tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter())
		.with_writer(std::io::stderr)
		.init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn explicit_settings_file_is_loaded() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("daemon.toml");
		std::fs::write(&path, "idle_timeout = 5\nprovenance = false\n").unwrap();

		let settings = load_settings(Some(&path)).unwrap();
		assert_eq!(settings.idle_timeout, Duration::from_secs(5));
		assert!(!settings.provenance);
	}

	#[test]
	fn broken_settings_file_names_the_path() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("daemon.toml");
		std::fs::write(&path, "idle_timeout = \"soon\"\n").unwrap();

		let error = load_settings(Some(&path)).unwrap_err();
		assert!(error.to_string().contains("daemon.toml"));
	}
}
