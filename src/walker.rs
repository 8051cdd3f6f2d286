//! Recursive source-directory walking, skipping symlinks and configured ignore names.
//!
//! Adapted from `utils.py::list_files_recursive_iter` (skips symlinks) and `settings.py`'s
//! `IGNORE_DIRS`/`IGNORE_FILES` lists, using `walkdir`'s `filter_entry` for recursive file
//! discovery, pruning ignored directories before descending into them.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Directory names never descended into.
pub const IGNORE_DIRS: &[&str] = &[
	"lost+found",
	"node_modules",
	".venv",
	"__pycache__",
	".git",
	".DS_Store",
	"@eaDir",
	".Spotlight-V100",
	".Trashes",
	".fseventsd",
	".DocumentRevisions-V100",
	".TemporaryItems",
	"#recycle",
	"System Volume Information",
];

/// File names never yielded.
pub const IGNORE_FILES: &[&str] = &["desktop.ini", "Thumbs.db"];

/// Recursively list files under `root`, skipping symlinks and anything matching the ignore lists.
pub fn list_files(root: &Path) -> impl Iterator<Item = PathBuf> + '_ {
	WalkDir::new(root)
		.into_iter()
		.filter_entry(|entry| {
			let name = entry.file_name().to_string_lossy();
			!IGNORE_DIRS.contains(&name.as_ref()) && !IGNORE_FILES.contains(&name.as_ref())
		})
		.filter_map(|entry| entry.ok())
		.filter(|entry| {
			entry.file_type().is_file() && !entry.path_is_symlink()
		})
		.map(|entry| entry.into_path())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::tempdir;

	#[test]
	fn skips_ignored_directories() {
		let dir = tempdir().unwrap();
		fs::create_dir_all(dir.path().join(".git")).unwrap();
		fs::write(dir.path().join(".git/HEAD"), b"ref: refs/heads/main").unwrap();
		fs::write(dir.path().join("keep.txt"), b"data").unwrap();

		let files: Vec<_> = list_files(dir.path()).collect();
		assert_eq!(files.len(), 1);
		assert_eq!(files[0].file_name().unwrap(), "keep.txt");
	}

	#[test]
	fn skips_ignored_filenames() {
		let dir = tempdir().unwrap();
		fs::write(dir.path().join("Thumbs.db"), b"junk").unwrap();
		fs::write(dir.path().join("real.txt"), b"data").unwrap();

		let files: Vec<_> = list_files(dir.path()).collect();
		assert_eq!(files.len(), 1);
		assert_eq!(files[0].file_name().unwrap(), "real.txt");
	}

	#[test]
	fn recurses_into_non_ignored_subdirectories() {
		let dir = tempdir().unwrap();
		fs::create_dir_all(dir.path().join("a/b")).unwrap();
		fs::write(dir.path().join("a/b/nested.txt"), b"data").unwrap();

		let files: Vec<_> = list_files(dir.path()).collect();
		assert_eq!(files.len(), 1);
	}
}
