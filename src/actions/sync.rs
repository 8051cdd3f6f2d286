use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn};

use crate::{
	actions::Context,
	aws::{self, AwsFlags, S3Sink},
	store::{StateStore, WorkStatus},
};

/// Reconcile a state database against the bucket's actual contents.
///
/// Every part recorded as `UPLOADED` is checked with `HeadObject`; any that are missing (for
/// example because someone deleted the object manually) are reset to `FAILED`, so a subsequent
/// `resume` re-uploads them.
#[derive(Debug, Clone, Parser)]
pub struct SyncArgs {
	/// State database to reconcile.
	pub db_filename: PathBuf,

	/// S3 bucket the parts were uploaded to.
	#[arg(long)]
	pub bucket: String,

	#[command(flatten)]
	pub aws: AwsFlags,
}

pub async fn run(ctx: Context<SyncArgs>) -> Result<()> {
	let args = ctx.args_top;
	let store = StateStore::open(&args.db_filename).into_diagnostic()?;
	let sdk_config = aws::init(&args.aws).await;
	let sink = S3Sink::new(&sdk_config, args.bucket.clone(), false);

	let uploaded = store.uploaded_part_names().into_diagnostic()?;
	let mut repaired = 0;
	for tar_file in &uploaded {
		let exists = sink.head_object(tar_file).await.into_diagnostic()?;
		if !exists {
			warn!(tar_file, "recorded as UPLOADED but missing from bucket, marking FAILED");
			store.set_status(tar_file, WorkStatus::Failed).into_diagnostic()?;
			repaired += 1;
		}
	}

	info!(checked = uploaded.len(), repaired, "sync complete");
	Ok(())
}
