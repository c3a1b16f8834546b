//! Running the external tool against a resolved fork.

use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, bail};
use eels_forks::ResolvedFork;

/// Environment variable holding the tool command line.
pub const TOOL_ENV: &str = "EELS_TOOL";

/// Tool command used when [`TOOL_ENV`] is unset.
pub const DEFAULT_TOOL: &str = "python3 -m ethereum_spec_tools.evm_tools";

/// Value of `--state.fork` in raw tool arguments.
pub fn fork_arg(args: &[OsString]) -> Option<String> {
	let mut args = args.iter().map(|arg| arg.to_string_lossy());
	while let Some(arg) = args.next() {
		if arg == "--state.fork" {
			return args.next().map(|value| value.into_owned());
		}
		if let Some(value) = arg.strip_prefix("--state.fork=") {
			return Some(value.to_string());
		}
	}
	None
}

/// Splits a whitespace separated tool command into program and leading args.
pub fn tool_argv(spec: &str) -> anyhow::Result<(String, Vec<String>)> {
	let mut words = spec.split_whitespace().map(str::to_string);
	let Some(program) = words.next() else {
		bail!("{TOOL_ENV} is empty");
	};
	Ok((program, words.collect()))
}

/// Module search path with `src` in front of `existing`.
pub fn pythonpath(src: &Path, existing: Option<&OsStr>) -> anyhow::Result<OsString> {
	let rest = existing
		.map(|paths| std::env::split_paths(paths).collect::<Vec<_>>())
		.unwrap_or_default();
	let paths = std::iter::once(src.to_path_buf()).chain(rest.into_iter().filter(|p| !p.as_os_str().is_empty()));
	std::env::join_paths(paths).with_context(|| format!("cannot put {} on PYTHONPATH", src.display()))
}

/// Builds the tool invocation for `resolved` with `args` after the tool's own.
pub fn command<I, S>(spec: &str, resolved: &ResolvedFork, existing_pythonpath: Option<&OsStr>, args: I) -> anyhow::Result<Command>
where
	I: IntoIterator<Item = S>,
	S: AsRef<OsStr>,
{
	let (program, leading) = tool_argv(spec)?;
	let mut command = Command::new(program);
	command
		.args(leading)
		.args(args)
		.env("PYTHONPATH", pythonpath(&resolved.src_dir(), existing_pythonpath)?);
	Ok(command)
}

/// Builds the tool invocation from the process environment.
pub fn command_from_env<I, S>(resolved: &ResolvedFork, args: I) -> anyhow::Result<Command>
where
	I: IntoIterator<Item = S>,
	S: AsRef<OsStr>,
{
	let spec = std::env::var(TOOL_ENV).unwrap_or_else(|_| DEFAULT_TOOL.to_string());
	command(&spec, resolved, std::env::var_os("PYTHONPATH").as_deref(), args)
}

/// Replaces the current process with `command`. Only returns on failure.
pub fn exec(mut command: Command) -> anyhow::Error {
	let program = PathBuf::from(command.get_program());
	tracing::debug!(program = %program.display(), args = ?command.get_args().collect::<Vec<_>>(), "exec tool");
	let error = command.exec();
	anyhow::Error::new(error).context(format!("failed to run {}", program.display()))
}
