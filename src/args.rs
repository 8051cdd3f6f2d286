use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use tracing::{debug, warn};

/// Resumable, encrypted, chunked archival uploader for S3-compatible object stores.
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help.",
)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
	/// When to use terminal colours
	#[arg(long, default_value = "auto", value_name = "MODE", alias = "colour")]
	pub color: ColourMode,

	/// Set diagnostic log level
	///
	/// This enables diagnostic logging, which is useful for investigating bugs. Use multiple
	/// times to increase verbosity. Goes up to '-vvvvv'.
	///
	/// You may want to use with '--log-file' to avoid polluting your terminal.
	///
	/// Setting $RUST_LOG also works, and takes precedence, but is not recommended unless you know
	/// what you're doing. However, using $RUST_LOG is the only way to get logs from before these
	/// options are parsed.
	#[arg(
		long,
		short,
		action = ArgAction::Count,
		num_args = 0,
	)]
	pub verbose: Option<u8>,

	/// Write diagnostic logs to a file
	///
	/// This writes diagnostic logs to a rotating file, instead of (as well as) the terminal. If
	/// the path provided is a directory, a file will be created in that directory, rotated daily.
	#[arg(
		long,
		num_args = 0..=1,
		default_missing_value = ".",
		value_hint = ValueHint::AnyPath,
		value_name = "PATH",
	)]
	pub log_file: Option<PathBuf>,

	/// What to do
	#[command(subcommand)]
	pub action: crate::actions::Action,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ColourMode {
	Auto,
	Always,
	Never,
}

pub fn get_args() -> Args {
	if std::env::var("RUST_LOG").is_ok() {
		warn!("⚠ RUST_LOG environment variable set, logging options have no effect");
	}

	debug!("parsing arguments");
	let args = Args::parse();

	debug!(?args, "got arguments");
	args
}

/// Configure the rotating-file + console tracing subscribers described at interface-level only;
/// this is ordinary logging glue, not part of the core library's contract.
pub fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
	use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

	let verbosity = args.verbose.unwrap_or(0);
	let default_filter = match verbosity {
		0 => "info",
		1 => "info,permafrost=debug",
		2 => "debug",
		3 => "debug,permafrost=trace",
		_ => "trace",
	};
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

	let console_layer = fmt::layer()
		.with_ansi(match args.color {
			ColourMode::Auto => atty_stderr(),
			ColourMode::Always => true,
			ColourMode::Never => false,
		})
		.with_writer(std::io::stderr);

	if let Some(path) = &args.log_file {
		let (dir, prefix) = if path.is_dir() || path == std::path::Path::new(".") {
			(path.clone(), "permafrost".to_string())
		} else {
			(
				path.parent().unwrap_or(std::path::Path::new(".")).to_path_buf(),
				path.file_name()
					.and_then(|n| n.to_str())
					.unwrap_or("permafrost")
					.to_string(),
			)
		};
		let file_appender = tracing_appender::rolling::daily(dir, prefix);
		let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
		let file_layer = fmt::layer().json().with_ansi(false).with_writer(non_blocking);

		tracing_subscriber::registry()
			.with(env_filter)
			.with(console_layer)
			.with(file_layer)
			.init();
		Some(guard)
	} else {
		tracing_subscriber::registry()
			.with(env_filter)
			.with(console_layer)
			.init();
		None
	}
}

fn atty_stderr() -> bool {
	use std::io::IsTerminal;
	std::io::stderr().is_terminal()
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
