//! The Part Writer: a byte sink for a single part, optionally ChaCha20-encrypting as it goes,
//! writing to a temp path and atomically renaming into place on commit.
//!
//! Adapted from `libs/fileobjs.py`'s `EncryptSplitFileObj`: `write()` there maps to [`append`],
//! and `close()`'s rename-then-callback maps to [`commit`].

use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};

use crate::{
	crypto::PartCipher,
	error::{Error, Result},
};

/// A single part's output stream: bytes in, an encrypted (or plain) file on disk out.
pub struct PartWriter {
	file: Option<File>,
	temp_path: PathBuf,
	final_path: PathBuf,
	cipher: Option<PartCipher>,
	written: u64,
}

impl PartWriter {
	/// Begin writing a new part at `final_path`, via a sibling temp file.
	///
	/// If `key` is `Some`, bytes are ChaCha20-encrypted before being written, with the nonce
	/// derived from `final_path`'s basename.
	pub fn create(final_path: impl Into<PathBuf>, key: Option<&[u8]>) -> Result<Self> {
		let final_path = final_path.into();
		let temp_path = temp_sibling(&final_path);
		let file = File::create(&temp_path)
			.map_err(|e| Error::filesystem(temp_path.clone(), e))?;

		let basename = final_path
			.file_name()
			.and_then(|n| n.to_str())
			.unwrap_or_default()
			.to_string();
		let cipher = key.map(|k| PartCipher::new(k, &basename));

		Ok(Self {
			file: Some(file),
			temp_path,
			final_path,
			cipher,
			written: 0,
		})
	}

	/// How many bytes have been written so far (ciphertext and plaintext are equal in length).
	pub fn tell(&self) -> u64 {
		self.written
	}

	/// The part's eventual final path.
	pub fn final_path(&self) -> &Path {
		&self.final_path
	}

	/// Append `buf` to the part, encrypting first if configured.
	pub fn append(&mut self, buf: &[u8]) -> Result<()> {
		let file = self
			.file
			.as_mut()
			.expect("append called after close");

		let mut owned;
		let out: &[u8] = if let Some(cipher) = self.cipher.as_mut() {
			owned = buf.to_vec();
			cipher.apply(&mut owned);
			&owned
		} else {
			buf
		};

		file.write_all(out)
			.map_err(|e| Error::filesystem(self.temp_path.clone(), e))?;
		self.written += buf.len() as u64;
		Ok(())
	}

	/// Flush, close, and atomically rename the temp file into place, then invoke `on_commit`
	/// with the final path. Idempotent: a second call is a no-op.
	pub fn commit(&mut self, on_commit: impl FnOnce(&Path)) -> Result<()> {
		let Some(mut file) = self.file.take() else {
			return Ok(());
		};
		file.flush()
			.map_err(|e| Error::filesystem(self.temp_path.clone(), e))?;
		drop(file);

		fs::rename(&self.temp_path, &self.final_path)
			.map_err(|e| Error::filesystem(self.final_path.clone(), e))?;

		on_commit(&self.final_path);
		Ok(())
	}

	/// Abandon the part: close and delete the temp file without renaming. Idempotent.
	pub fn abort(&mut self) -> Result<()> {
		if self.file.take().is_none() {
			return Ok(());
		}
		let _ = fs::remove_file(&self.temp_path);
		Ok(())
	}
}

impl Drop for PartWriter {
	fn drop(&mut self) {
		if self.file.take().is_some() {
			let _ = fs::remove_file(&self.temp_path);
		}
	}
}

fn temp_sibling(final_path: &Path) -> PathBuf {
	let mut name = final_path
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or("part")
		.to_string();
	name.push_str(".tmp");
	final_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn commit_renames_into_place_and_invokes_callback() {
		let dir = tempdir().unwrap();
		let final_path = dir.path().join("001_backup.tar");

		let mut writer = PartWriter::create(&final_path, None).unwrap();
		writer.append(b"hello").unwrap();
		assert_eq!(writer.tell(), 5);
		assert!(!final_path.exists());

		let mut committed = None;
		writer.commit(|p| committed = Some(p.to_path_buf())).unwrap();
		assert_eq!(committed, Some(final_path.clone()));
		assert_eq!(fs::read(&final_path).unwrap(), b"hello");
	}

	#[test]
	fn abort_deletes_temp_file() {
		let dir = tempdir().unwrap();
		let final_path = dir.path().join("001_backup.tar");

		let mut writer = PartWriter::create(&final_path, None).unwrap();
		writer.append(b"partial").unwrap();
		writer.abort().unwrap();

		assert!(!final_path.exists());
		assert!(!temp_sibling(&final_path).exists());
	}

	#[test]
	fn commit_is_idempotent() {
		let dir = tempdir().unwrap();
		let final_path = dir.path().join("001_backup.tar");

		let mut writer = PartWriter::create(&final_path, None).unwrap();
		writer.append(b"x").unwrap();

		let mut calls = 0;
		writer.commit(|_| calls += 1).unwrap();
		writer.commit(|_| calls += 1).unwrap();
		assert_eq!(calls, 1);
	}

	#[test]
	fn encrypted_part_round_trips_through_cipher() {
		let dir = tempdir().unwrap();
		let final_path = dir.path().join("001_backup.tar.chacha20");
		let key = [3u8; crate::crypto::KEY_LENGTH];

		let mut writer = PartWriter::create(&final_path, Some(&key)).unwrap();
		writer.append(b"top secret contents").unwrap();
		writer.commit(|_| {}).unwrap();

		let ciphertext = fs::read(&final_path).unwrap();
		assert_ne!(ciphertext, b"top secret contents");

		let basename = final_path.file_name().unwrap().to_str().unwrap();
		let mut cipher = crate::crypto::PartCipher::new(&key, basename);
		let mut plaintext = ciphertext;
		cipher.apply(&mut plaintext);
		assert_eq!(plaintext, b"top secret contents");
	}
}
