use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::info;

use crate::{
	actions::Context,
	aws::AwsFlags,
	backup_engine::{self, AwsFlagsCopy, BackupRunArgs, CompressionArg},
	store::StateStore,
};

const DEFAULT_NUM_UPLOAD_WORKERS: usize = 5;
const DEFAULT_SPLIT_SIZE_GIGABYTES: u64 = 100;
const STATE_DB_STRFTIME: &str = "%Y%m%d-%H%M%S_backup_statedb.sqlite3";

/// Start a new backup run.
///
/// Walks `--src-dirs` recursively, packs files into POSIX PAX tar parts of at most
/// `--split-size`, optionally compresses and encrypts each part, and uploads them to S3 as they
/// complete. Progress is recorded in a new state database so an interrupted run can be continued
/// with `resume`.
#[derive(Debug, Clone, Parser)]
pub struct BackupArgs {
	/// Template for output part filenames; each part is named `<NNN>_<basename>[.ext][.chacha20]`.
	pub output_filename_template: String,

	/// Source directories to back up, walked recursively.
	#[arg(long, required = true, num_args = 1..)]
	pub src_dirs: Vec<PathBuf>,

	/// Maximum size of one part, in GB (or MB under `--test-run`), before rotating to the next.
	#[arg(long, default_value_t = DEFAULT_SPLIT_SIZE_GIGABYTES)]
	pub split_size: u64,

	/// S3 bucket to upload parts to.
	#[arg(long)]
	pub bucket: String,

	/// Number of concurrent upload workers.
	#[arg(long, default_value_t = DEFAULT_NUM_UPLOAD_WORKERS)]
	pub num_upload_workers: usize,

	/// Compression applied to each part's tar stream.
	#[arg(long, value_enum, default_value_t = CompressionArg::None)]
	pub compression: CompressionArg,

	/// Encrypt each part with ChaCha20 (default).
	#[arg(long, conflicts_with = "no_encrypt")]
	pub encrypt: bool,
	/// Disable per-part encryption.
	#[arg(long)]
	pub no_encrypt: bool,

	/// Delete each part's local file once it's been uploaded (default).
	#[arg(long, conflicts_with = "no_autoclean")]
	pub autoclean: bool,
	/// Keep each part's local file after upload.
	#[arg(long)]
	pub no_autoclean: bool,

	/// Use MB instead of GB for `--split-size` and skip the DEEP_ARCHIVE storage class, for
	/// testing against a local/Minio-style endpoint.
	#[arg(long)]
	pub test_run: bool,

	#[command(flatten)]
	pub aws: AwsFlags,
}

impl BackupArgs {
	fn into_run_args(self) -> BackupRunArgs {
		BackupRunArgs {
			output_filename_template: self.output_filename_template,
			src_dirs: self.src_dirs,
			split_size_value: self.split_size,
			bucket: self.bucket,
			num_upload_workers: self.num_upload_workers,
			compression: self.compression,
			encrypt: self.encrypt || !self.no_encrypt,
			autoclean: self.autoclean || !self.no_autoclean,
			test_run: self.test_run,
			aws: AwsFlagsCopy::from(&self.aws),
		}
	}
}

pub async fn run(ctx: Context<BackupArgs>) -> Result<()> {
	let args = ctx.args_top.clone().into_run_args();

	let db_filename = chrono::Utc::now().format(STATE_DB_STRFTIME).to_string();
	let db_path = PathBuf::from(&db_filename);
	info!(db = %db_path.display(), "starting new backup run");

	let store = std::sync::Arc::new(StateStore::open(&db_path).into_diagnostic()?);
	store.record_run(&args).into_diagnostic()?;

	let cancel = tokio_util::sync::CancellationToken::new();
	let handler_cancel = cancel.clone();
	let _ = ctrlc::set_handler(move || {
		tracing::warn!("received interrupt, finishing in-flight uploads and stopping");
		handler_cancel.cancel();
	});

	// Each part's size is only known once it's fully written, so there's no byte total to track
	// *during* packaging; instead each closed part gets its own completed data bar, giving a
	// running, skimmable record of what's been packaged and how big it was.
	let on_part_closed = {
		let ctx = ctx.clone();
		move |path: &std::path::Path| {
			let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
			let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
			let bar = ctx.data_bar(len);
			bar.set_position(len);
			bar.finish_with_message(format!("{name} packaged"));
		}
	};

	backup_engine::run_backup(
		store,
		&args,
		&std::env::current_dir().into_diagnostic()?,
		cancel,
		on_part_closed,
	)
	.await
	.into_diagnostic()
}
