//! The Split Tar Producer: a streaming POSIX PAX tar encoder over the current [`PartWriter`],
//! rotating to a new part on demand. Adapted from `libs/spilt_tarfiles.py`'s `SplitTarFiles`.
//!
//! Splitting policy is the orchestrator's call, not this type's: callers check
//! [`SplitTarProducer::tell`] against their configured split size *before* adding a file, and
//! call [`rotate`](SplitTarProducer::rotate) first if needed, so a file is never split across
//! parts.

use std::{
	cell::RefCell,
	io::{self, Write},
	path::{Path, PathBuf},
	rc::Rc,
};

use tar::{Builder, HeaderMode};

use crate::{
	error::{Error, Result},
	part_writer::PartWriter,
};

/// Compression applied to each part's tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
	None,
	Gz,
	Bz2,
	Xz,
}

impl Compression {
	pub fn extension(self) -> Option<&'static str> {
		match self {
			Compression::None => None,
			Compression::Gz => Some("gz"),
			Compression::Bz2 => Some("bz2"),
			Compression::Xz => Some("xz"),
		}
	}
}

/// A `Write` adapter handing bytes to a shared [`PartWriter`], so the tar encoder and the
/// orchestrator's `tell()` check can both see the same underlying part.
#[derive(Clone)]
struct SharedPartSink(Rc<RefCell<PartWriter>>);

impl Write for SharedPartSink {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0
			.borrow_mut()
			.append(buf)
			.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

enum Encoder {
	None(SharedPartSink),
	Gz(flate2::write::GzEncoder<SharedPartSink>),
	Bz2(bzip2::write::BzEncoder<SharedPartSink>),
	Xz(xz2::write::XzEncoder<SharedPartSink>),
}

impl Write for Encoder {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Encoder::None(w) => w.write(buf),
			Encoder::Gz(w) => w.write(buf),
			Encoder::Bz2(w) => w.write(buf),
			Encoder::Xz(w) => w.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Encoder::None(w) => w.flush(),
			Encoder::Gz(w) => w.flush(),
			Encoder::Bz2(w) => w.flush(),
			Encoder::Xz(w) => w.flush(),
		}
	}
}

impl Encoder {
	fn finish(self) -> io::Result<()> {
		match self {
			Encoder::None(_) => Ok(()),
			Encoder::Gz(w) => w.finish().map(drop),
			Encoder::Bz2(w) => w.finish().map(drop),
			Encoder::Xz(w) => w.finish().map(drop),
		}
	}
}

struct CurrentPart {
	writer: Rc<RefCell<PartWriter>>,
	tar: Builder<Encoder>,
}

/// Wraps a streaming tar+compression pipeline over a sequence of [`PartWriter`]s.
pub struct SplitTarProducer {
	output_dir: PathBuf,
	template_basename: String,
	compression: Compression,
	encrypt_key: Option<Vec<u8>>,
	part_index: u32,
	current: Option<CurrentPart>,
}

impl SplitTarProducer {
	/// `starting_index` is the dense zero-padded part index the first part should use (normally
	/// the count of already-`UPLOADED` parts, for resumption).
	pub fn new(
		output_dir: impl Into<PathBuf>,
		template_basename: impl Into<String>,
		compression: Compression,
		encrypt_key: Option<Vec<u8>>,
		starting_index: u32,
	) -> Result<Self> {
		let mut this = Self {
			output_dir: output_dir.into(),
			template_basename: template_basename.into(),
			compression,
			encrypt_key,
			part_index: starting_index,
			current: None,
		};
		this.open_new_part()?;
		Ok(this)
	}

	/// The on-disk name of the part currently being written.
	pub fn current_part_name(&self) -> String {
		part_filename(
			self.part_index,
			&self.template_basename,
			self.compression,
			self.encrypt_key.is_some(),
		)
	}

	/// Bytes written to the current part so far, post-tar-encoding. This is what split-size
	/// policy must compare against, since it's what actually hits disk.
	pub fn tell(&self) -> u64 {
		self.current
			.as_ref()
			.map(|c| c.writer.borrow().tell())
			.unwrap_or(0)
	}

	/// Add a file to the current part's tar stream.
	pub fn add(&mut self, path: &Path, archive_path: &Path) -> Result<()> {
		let current = self
			.current
			.as_mut()
			.expect("SplitTarProducer used after close");
		current
			.tar
			.append_path_with_name(path, archive_path)
			.map_err(|e| Error::filesystem(path.to_path_buf(), e))
	}

	/// Finalize and commit the current part, then open the next one. Returns the just-closed
	/// part's final on-disk path, so the caller can submit it for upload.
	pub fn rotate(&mut self) -> Result<PathBuf> {
		let path = self.close_current(true)?;
		self.part_index += 1;
		self.open_new_part()?;
		Ok(path)
	}

	/// Finalize and commit the current part without opening another. Called on scope exit.
	/// Returns the closed part's final on-disk path.
	pub fn finish(mut self) -> Result<PathBuf> {
		self.close_current(true)
	}

	fn open_new_part(&mut self) -> Result<()> {
		let name = self.current_part_name();
		let final_path = self.output_dir.join(&name);
		let writer = Rc::new(RefCell::new(PartWriter::create(
			final_path,
			self.encrypt_key.as_deref(),
		)?));

		let sink = SharedPartSink(writer.clone());
		let encoder = match self.compression {
			Compression::None => Encoder::None(sink),
			Compression::Gz => {
				Encoder::Gz(flate2::write::GzEncoder::new(sink, flate2::Compression::default()))
			}
			Compression::Bz2 => {
				Encoder::Bz2(bzip2::write::BzEncoder::new(sink, bzip2::Compression::default()))
			}
			Compression::Xz => Encoder::Xz(xz2::write::XzEncoder::new(sink, 6)),
		};

		let mut tar = Builder::new(encoder);
		tar.mode(HeaderMode::Complete);
		self.current = Some(CurrentPart { writer, tar });
		Ok(())
	}

	fn close_current(&mut self, commit: bool) -> Result<PathBuf> {
		let Some(current) = self.current.take() else {
			return Ok(self.output_dir.join(self.current_part_name()));
		};
		let CurrentPart { writer, tar } = current;

		let encoder = tar
			.into_inner()
			.map_err(|e| Error::filesystem(self.output_dir.clone(), e))?;
		encoder
			.finish()
			.map_err(|e| Error::filesystem(self.output_dir.clone(), e))?;

		// The tar encoder's own clone of the sink was dropped by `finish()` above, so this is
		// the last handle to the part writer.
		let mut writer = Rc::try_unwrap(writer)
			.unwrap_or_else(|_| panic!("part writer has unexpected outstanding references"))
			.into_inner();
		let final_path = writer.final_path().to_path_buf();
		if commit {
			writer.commit(|_| {})?;
		} else {
			writer.abort()?;
		}
		Ok(final_path)
	}
}

/// Construct a part's on-disk filename: `<3-digit idx>_<basename>[.ext][.chacha20]`.
pub fn part_filename(
	index: u32,
	template_basename: &str,
	compression: Compression,
	encrypted: bool,
) -> String {
	let mut name = format!("{index:03}_{template_basename}");
	if let Some(ext) = compression.extension() {
		name.push('.');
		name.push_str(ext);
	}
	if encrypted {
		name.push_str(".chacha20");
	}
	name
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::tempdir;

	#[test]
	fn filenames_are_dense_and_zero_padded() {
		assert_eq!(
			part_filename(0, "backup.tar", Compression::None, false),
			"000_backup.tar"
		);
		assert_eq!(
			part_filename(12, "backup.tar", Compression::Gz, true),
			"012_backup.tar.gz.chacha20"
		);
	}

	#[test]
	fn rotate_commits_current_part_and_starts_next() {
		let dir = tempdir().unwrap();
		let src = dir.path().join("file.txt");
		fs::write(&src, b"contents").unwrap();

		let mut producer =
			SplitTarProducer::new(dir.path(), "backup.tar", Compression::None, None, 0).unwrap();
		assert_eq!(producer.current_part_name(), "000_backup.tar");

		producer.add(&src, Path::new("file.txt")).unwrap();
		assert!(producer.tell() > 0);

		producer.rotate().unwrap();
		assert_eq!(producer.current_part_name(), "001_backup.tar");
		assert!(dir.path().join("000_backup.tar").exists());

		producer.finish().unwrap();
		assert!(dir.path().join("001_backup.tar").exists());
	}

	#[test]
	fn starting_index_resumes_from_given_count() {
		let dir = tempdir().unwrap();
		let producer =
			SplitTarProducer::new(dir.path(), "backup.tar", Compression::None, None, 5).unwrap();
		assert_eq!(producer.current_part_name(), "005_backup.tar");
		producer.finish().unwrap();
	}
}
