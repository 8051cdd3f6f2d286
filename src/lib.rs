#![deny(rust_2018_idioms)]

pub use crate::actions::run;

pub(crate) mod actions;
pub(crate) mod args;
pub(crate) mod aws;
pub(crate) mod backup_engine;
pub(crate) mod crypto;
pub mod error;
pub(crate) mod part_writer;
pub(crate) mod split_tar;
pub(crate) mod store;
pub(crate) mod walker;
pub(crate) mod worker_pool;

pub(crate) const APP_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Parse CLI arguments and set up logging. Returns the parsed args and, if file logging was
/// configured, a guard that must be held for the program's lifetime to flush pending writes.
pub fn args() -> miette::Result<(args::Args, Option<tracing_appender::non_blocking::WorkerGuard>)> {
	let args = args::get_args();
	let guard = args::init_logging(&args);
	Ok((args, guard))
}
