//! ChaCha20 stream cipher wrapper and the nonce-derivation scheme used by the Part Writer.
//!
//! There is deliberately no authentication tag here — this mirrors `libs/fileobjs.py`'s use of
//! `Cryptodome.Cipher.ChaCha20` directly rather than an AEAD construction. The nonce is derived,
//! not random: it is the part's own basename, repeated and truncated to 12 bytes. This is
//! idiosyncratic but intentional (see `SPEC_FULL.md` §9) — it lets `decrypt` reconstruct the
//! nonce from the filename alone, with no side-channel needed, at the cost of nonce reuse if a
//! part basename were ever repeated across runs against the same key. Part basenames are unique
//! within a run by construction (dense zero-padded index), so this holds.

use chacha20::{
	cipher::{KeyIvInit, StreamCipher},
	ChaCha20,
};

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;

/// Repeat `s` end-to-end until it is at least `len` bytes, then truncate to exactly `len`.
///
/// Grounded on `utils.py::repeat_string_until_length`.
pub fn repeat_to_length(s: &str, len: usize) -> Vec<u8> {
	let bytes = s.as_bytes();
	if bytes.is_empty() {
		return vec![0u8; len];
	}
	let mut out = Vec::with_capacity(len);
	while out.len() < len {
		out.extend_from_slice(bytes);
    }
	out.truncate(len);
	out
}

/// Derive the 12-byte nonce for a part from its basename.
pub fn derive_nonce(part_basename: &str) -> [u8; NONCE_LENGTH] {
	let bytes = repeat_to_length(part_basename, NONCE_LENGTH);
	let mut nonce = [0u8; NONCE_LENGTH];
	nonce.copy_from_slice(&bytes);
	nonce
}

/// A ChaCha20 keystream cipher for one part, encrypting or decrypting in place.
pub struct PartCipher {
	cipher: ChaCha20,
}

impl PartCipher {
	pub fn new(key: &[u8], part_basename: &str) -> Self {
		assert_eq!(key.len(), KEY_LENGTH, "encryption key must be 32 bytes");
		let nonce = derive_nonce(part_basename);
		let cipher = ChaCha20::new(key.into(), &nonce.into());
		Self { cipher }
	}

	/// Encrypt (or decrypt — ChaCha20 is its own inverse) `buf` in place.
	pub fn apply(&mut self, buf: &mut [u8]) {
		self.cipher.apply_keystream(buf);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn repeats_and_truncates() {
		assert_eq!(repeat_to_length("abc", 7), b"abcabca");
		assert_eq!(repeat_to_length("0123456789ab", 12), b"0123456789ab");
		assert_eq!(repeat_to_length("x", 3), b"xxx");
	}

	#[test]
	fn nonce_is_twelve_bytes() {
		let nonce = derive_nonce("001_backup.tar");
		assert_eq!(nonce.len(), NONCE_LENGTH);
	}

	#[test]
	fn different_basenames_give_different_nonces() {
		assert_ne!(derive_nonce("001_backup.tar"), derive_nonce("002_backup.tar"));
	}

	#[test]
	fn encrypt_then_decrypt_round_trips() {
		let key = [7u8; KEY_LENGTH];
		let mut data = b"hello, permafrost".to_vec();
		let original = data.clone();

		PartCipher::new(&key, "003_part.tar").apply(&mut data);
		assert_ne!(data, original);

		PartCipher::new(&key, "003_part.tar").apply(&mut data);
		assert_eq!(data, original);
	}
}
