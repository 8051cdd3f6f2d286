use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The four error kinds the core library can raise.
///
/// `ValidationError` from the original design lives entirely in the CLI argument layer (clap's
/// own validation) and never reaches this type.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
	/// The state database is missing expected tables/columns, or a query against it failed in a
	/// way that indicates corruption rather than a transient I/O problem. Fatal for the whole run.
	#[error("state database is corrupt or unreadable: {0}")]
	#[diagnostic(code(permafrost::corrupt_db))]
	CorruptDb(#[from] rusqlite::Error),

	/// A filesystem operation failed while writing or reading a part. Fatal for the current part;
	/// the orchestrator discards it and continues with the next file.
	#[error("filesystem error on {path}: {source}")]
	#[diagnostic(code(permafrost::filesystem))]
	Filesystem {
		path: std::path::PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// A network operation (upload, head, delete) against the object store failed. Recoverable;
	/// the worker pool retries with jittered backoff.
	#[error("network error talking to the object store: {0}")]
	#[diagnostic(code(permafrost::network))]
	Network(String),

	/// Credentials were rejected or are missing. Fatal for the run; retrying will not help.
	#[error("authentication with the object store failed: {0}")]
	#[diagnostic(code(permafrost::auth))]
	Auth(String),
}

impl Error {
	pub fn filesystem(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
		Self::Filesystem {
			path: path.into(),
			source,
		}
	}

	/// Whether the worker pool should retry this error rather than abandon the run.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, Error::Network(_))
	}
}
