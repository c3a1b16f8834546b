use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eels_forks::{ConfigError, OverrideSource};


#[derive(Parser, Debug)]
#[command(name = "ethereum-spec-evm-resolver")]
#[command(about = "Runs execution-spec tools against the fork named by each request")]
#[command(version)]
/// Command-line arguments.
pub struct Cli {
	/// Resolution overrides as an inline JSON object
	#[arg(long, value_name = "JSON")]
	pub resolutions: Option<String>,

	/// JSON file with resolution overrides
	#[arg(long, value_name = "PATH")]
	pub resolutions_file: Option<PathBuf>,

	/// Daemon settings file (TOML)
	#[arg(long, value_name = "PATH")]
	pub config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	pub verbose: bool,

	/// Subcommand to execute.
	#[command(subcommand)]
	pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
	/// Run the routing daemon on a Unix socket
	Daemon {
		/// Socket to listen on
		#[arg(long, value_name = "PATH")]
		uds: PathBuf,
		/// Seconds without requests before shutting down
		#[arg(long, value_name = "SECS")]
		idle_timeout: Option<f64>,
	},
	/// Resolve a fork and run the tool's daemon for it
	SpawnDaemon {
		/// Fork to serve
		#[arg(long = "state.fork", value_name = "FORK")]
		fork: String,
		/// Socket the tool daemon listens on
		#[arg(long, value_name = "PATH")]
		uds: PathBuf,
		/// Tool daemon timeout, passed through
		#[arg(long, value_name = "SECS")]
		timeout: Option<u64>,
	},
	/// Refetch the snapshot of a fork
	Update {
		/// Fork to refresh
		#[arg(long = "state.fork", value_name = "FORK")]
		fork: String,
	},
	/// Print how forks resolve, without fetching
	Info {
		/// Only this fork
		#[arg(long = "state.fork", value_name = "FORK")]
		fork: Option<String>,
	},
	/// Any other tool subcommand (t8n, b11r, ...), run against `--state.fork`
	#[command(external_subcommand)]
	Tool(Vec<OsString>),
}

impl Cli {
	/// Override source after merging flags with the environment.
	///
	/// A flag wins over its environment variable; supplying both an inline
	/// table and a file, from any mix of origins, is an error.
	pub fn override_source(&self, env_inline: Option<String>, env_file: Option<PathBuf>) -> Result<OverrideSource, ConfigError> {
		OverrideSource::from_parts(
			self.resolutions.clone().or(env_inline),
			self.resolutions_file.clone().or(env_file),
		)
	}
}
