use std::path::PathBuf;

use clap::Parser;
use miette::{bail, IntoDiagnostic, Result};
use tracing::info;

use crate::{
	actions::Context,
	aws::AwsFlags,
	backup_engine::{self, AwsFlagsCopy, BackupRunArgs},
	store::StateStore,
};

/// Continue an interrupted backup run from its state database.
///
/// Reuses the source directories, split size, bucket, compression and encryption settings
/// recorded by the original `backup` invocation; already-`UPLOADED` parts and files are skipped.
#[derive(Debug, Clone, Parser)]
pub struct ResumeArgs {
	/// State database of the run to resume.
	pub db_filename: PathBuf,

	#[command(flatten)]
	pub aws: AwsFlags,
}

pub async fn run(ctx: Context<ResumeArgs>) -> Result<()> {
	let args = ctx.args_top.clone();
	let store = std::sync::Arc::new(StateStore::open(&args.db_filename).into_diagnostic()?);

	let Some(last_args_json) = store.get_last_cmd_args().into_diagnostic()? else {
		bail!("state database has no recorded run to resume");
	};
	let mut run_args: BackupRunArgs = serde_json::from_str(&last_args_json).into_diagnostic()?;
	run_args.aws = AwsFlagsCopy::from(&args.aws);

	info!(db = %args.db_filename.display(), "resuming backup run");
	store.record_run(&run_args).into_diagnostic()?;

	let cancel = tokio_util::sync::CancellationToken::new();
	let handler_cancel = cancel.clone();
	let _ = ctrlc::set_handler(move || {
		tracing::warn!("received interrupt, finishing in-flight uploads and stopping");
		handler_cancel.cancel();
	});

	// As in `backup`, a part's size is only known once it's fully written, so each closed part
	// gets its own completed data bar rather than one bar tracking a running total.
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

	let output_dir = std::env::current_dir().into_diagnostic()?;
	backup_engine::run_backup(store, &run_args, &output_dir, cancel, on_part_closed)
		.await
		.into_diagnostic()
}
