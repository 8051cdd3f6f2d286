use clap::Subcommand;
use miette::Result;
use tracing::{debug, trace};

pub use context::Context;
pub mod context;

#[macro_export]
macro_rules! subcommands {
	(
		[$argtype:ty => $ctxcode:block]
		$(
			$modname:ident => $enumname:ident($argname:ident)
		),+
	) => {
		$(
			pub mod $modname;
		)*

		#[derive(Debug, Clone, Subcommand)]
		pub enum Action {
			$(
				$enumname($modname::$argname),
			)*
		}

		pub async fn run(ctx: $argtype) -> Result<()> {
			let ctxfn = $ctxcode;
			match ctxfn(ctx)? {
				$(
					(Action::$enumname(args), ctx) => $modname::run(ctx.with_top(args)).await,
				)*
			}
		}
	};
}
pub(crate) use subcommands;

use crate::args::Args;

subcommands! {
	[Args => {|args: Args| -> Result<(Action, Context<()>)> {
		let ctx = Context::new().with_top(args.action);
		debug!(version=%env!("CARGO_PKG_VERSION"), "starting up");
		trace!(?ctx, "context");
		Ok(ctx.take_top())
	}}]

	backup => Backup(BackupArgs),
	resume => Resume(ResumeArgs),
	show => Show(ShowArgs),
	decrypt => Decrypt(DecryptArgs),
	sync => Sync(SyncArgs),
	delete => Delete(DeleteArgs)
}
