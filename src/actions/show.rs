use std::{collections::BTreeMap, path::PathBuf};

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::{
	actions::Context,
	store::{to_local, StateStore, WorkRecord, WorkStatus},
};

/// Print the work records in a state database.
///
/// Without `--collate`, prints one row per source file. With `--collate N`, groups rows by their
/// source path truncated `N` directory levels upward, and aggregates each group's "uploaded"
/// state as a logical AND (a group only shows as uploaded once every file inside it is).
#[derive(Debug, Clone, Parser)]
pub struct ShowArgs {
	/// State database to read.
	pub db_filename: PathBuf,

	/// Group rows by their source path truncated N directory levels upward, instead of listing
	/// every file.
	#[arg(long, value_name = "N")]
	pub collate: Option<usize>,
}

pub async fn run(ctx: Context<ShowArgs>) -> Result<()> {
	let args = ctx.args_top;
	let store = StateStore::open(&args.db_filename).into_diagnostic()?;
	let records = store.all_records().into_diagnostic()?;

	match args.collate {
		Some(levels) if levels > 0 => print_collated(&records, levels),
		_ => print_flat(&records),
	}

	Ok(())
}

fn print_flat(records: &[WorkRecord]) {
	println!("{:<20} {:<24} {:<10} {}", "DATETIME", "TAR FILE", "STATUS", "FILENAME");
	for record in records {
		println!(
			"{:<20} {:<24} {:<10} {}",
			to_local(record.datetime).format("%Y-%m-%d %H:%M:%S"),
			record.tar_file,
			format!("{:?}", record.status).to_uppercase(),
			record.filename,
		);
	}
}

fn print_collated(records: &[WorkRecord], levels: usize) {
	struct Group {
		uploaded: bool,
		tar_files: std::collections::BTreeSet<String>,
		file_count: usize,
	}

	let mut groups: BTreeMap<String, Group> = BTreeMap::new();
	for record in records {
		let key = collate_key(&record.filename, levels);
		let group = groups.entry(key).or_insert_with(|| Group {
			uploaded: true,
			tar_files: Default::default(),
			file_count: 0,
		});
		group.uploaded &= record.status == WorkStatus::Uploaded;
		group.tar_files.insert(record.tar_file.clone());
		group.file_count += 1;
	}

	println!("{:<50} {:<10} {:<6} {}", "PATH", "UPLOADED", "FILES", "TAR FILES");
	for (key, group) in groups {
		println!(
			"{:<50} {:<10} {:<6} {}",
			key,
			group.uploaded,
			group.file_count,
			group.tar_files.into_iter().collect::<Vec<_>>().join(","),
		);
	}
}

/// Truncate `filename` upward by `levels` directory levels, repeatedly taking the parent
/// directory and stopping early if that would reach the filesystem root.
///
/// Mirrors `get_work_records_with_headers`'s `os.path.dirname()` loop: each step strips one
/// trailing path component, not one leading component.
fn collate_key(filename: &str, levels: usize) -> String {
	let mut current = std::path::PathBuf::from(filename);
	for _ in 0..levels {
		let Some(parent) = current.parent() else {
			break;
		};
		if parent.as_os_str().is_empty() || parent == std::path::Path::new(std::path::MAIN_SEPARATOR_STR) {
			break;
		}
		current = parent.to_path_buf();
	}
	current.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn collate_key_strips_one_trailing_component_per_level() {
		let key = collate_key("/data/projects/alpha/file.txt", 1);
		assert_eq!(key, format!("{0}data{0}projects{0}alpha", std::path::MAIN_SEPARATOR));
	}

	#[test]
	fn collate_key_stops_at_root_instead_of_overrunning() {
		let key = collate_key("/data/projects/alpha/file.txt", 3);
		assert_eq!(key, format!("{0}data", std::path::MAIN_SEPARATOR));

		// Asking for more levels than the path has never reaches `/` itself: the loop refuses
		// the step that would land there, exactly as the dirname loop it mirrors does.
		let key = collate_key("/data/projects/alpha/file.txt", 10);
		assert_eq!(key, format!("{0}data", std::path::MAIN_SEPARATOR));
	}
}
