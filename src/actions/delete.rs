use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::info;

use crate::{
	actions::Context,
	aws::{self, AwsFlags, S3Sink},
	store::StateStore,
};

/// Delete parts from the bucket and their work records from a state database.
#[derive(Debug, Clone, Parser)]
#[command(group = clap::ArgGroup::new("selection").required(true).args(["all", "files"]))]
pub struct DeleteArgs {
	/// State database to delete work records from.
	pub db_filename: PathBuf,

	/// S3 bucket the parts were uploaded to.
	#[arg(long)]
	pub bucket: String,

	/// Delete every recorded part.
	#[arg(long)]
	pub all: bool,

	/// Delete only these named parts.
	#[arg(long, num_args = 1..)]
	pub files: Vec<String>,

	#[command(flatten)]
	pub aws: AwsFlags,
}

pub async fn run(ctx: Context<DeleteArgs>) -> Result<()> {
	let args = ctx.args_top;
	let store = StateStore::open(&args.db_filename).into_diagnostic()?;
	let sdk_config = aws::init(&args.aws).await;
	let sink = S3Sink::new(&sdk_config, args.bucket.clone(), false);

	let targets = if args.all {
		store.uploaded_part_names().into_diagnostic()?
	} else {
		args.files.clone()
	};

	let mut deleted = 0;
	for tar_file in &targets {
		sink.delete_object(tar_file).await.into_diagnostic()?;
		if !args.all {
			store.delete_work_record(tar_file).into_diagnostic()?;
		}
		deleted += 1;
	}
	if args.all {
		store.delete_all_work_records().into_diagnostic()?;
	}

	info!(deleted, "delete complete");
	Ok(())
}
