use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::info;

use crate::{
	actions::Context,
	store::StateStore,
	walker,
	worker_pool::{Task, WorkerPool},
};

const DECRYPT_WORKERS: usize = 4;
const DECRYPT_PRODUCE_AHEAD: usize = 3;
const RETRY_WAIT_MINS: std::ops::RangeInclusive<u64> = 1..=2;

/// Decrypt every `.chacha20` part in a folder, using the key recorded in a state database.
///
/// Round-trips through the same [`crate::crypto::PartCipher`] the backup pipeline used to
/// encrypt each part, deriving each part's nonce from its own basename.
#[derive(Debug, Clone, Parser)]
pub struct DecryptArgs {
	/// State database holding the encryption key.
	pub db_filename: PathBuf,

	/// Folder containing the `.chacha20` part files to decrypt.
	pub tar_files_folder: PathBuf,

	/// Delete each ciphertext part once it's been decrypted (default).
	#[arg(long, conflicts_with = "no_autoclean")]
	pub autoclean: bool,
	/// Keep each ciphertext part after decrypting.
	#[arg(long)]
	pub no_autoclean: bool,
}

pub async fn run(ctx: Context<DecryptArgs>) -> Result<()> {
	let args = ctx.args_top;
	let autoclean = args.autoclean || !args.no_autoclean;

	let store = std::sync::Arc::new(StateStore::open(&args.db_filename).into_diagnostic()?);
	let cancel = tokio_util::sync::CancellationToken::new();
	let mut pool = WorkerPool::new(
		store.clone(),
		None,
		DECRYPT_WORKERS,
		DECRYPT_PRODUCE_AHEAD,
		RETRY_WAIT_MINS,
		cancel,
	);

	let mut found = 0;
	for path in walker::list_files(&args.tar_files_folder) {
		if path.extension().and_then(|e| e.to_str()) != Some("chacha20") {
			continue;
		}

		let output_path = path.with_extension("");
		let tar_file = path
			.file_name()
			.and_then(|n| n.to_str())
			.unwrap_or_default()
			.to_string();

		info!(file = %path.display(), "decrypting part");
		pool.submit(Task::Decrypt {
			tar_file,
			ciphertext_path: path,
			output_path,
			autoclean,
		})
		.await;
		found += 1;
	}

	pool.wait_on_all_tasks().await.into_diagnostic()?;
	info!(found, "decryption complete");
	Ok(())
}
