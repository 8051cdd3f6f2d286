//! PutObject/HeadObject/DeleteObject against the configured bucket, with SHA-256 checksums and
//! (outside `--test-run`) the `DEEP_ARCHIVE` storage class. Adapted from an existing
//! `multipart_upload`/`singlepart_upload` pair, simplified: this crate doesn't need a
//! progress-bar-driven adaptive chunker, just a size threshold above which S3 requires multipart
//! uploads at all (a single `PutObject` tops out at 5 GiB).

use std::path::Path;

use aws_sdk_s3::{
	primitives::ByteStream,
	types::{builders::CompletedMultipartUploadBuilder, ChecksumAlgorithm, CompletedPart, StorageClass},
	Client as S3Client,
};
use aws_config::SdkConfig;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

use super::MINIMUM_MULTIPART_PART_SIZE;

/// A single PutObject above this size must go through multipart upload (S3's hard limit on a
/// plain PutObject body is 5 GiB).
const SINGLEPART_LIMIT_BYTES: u64 = 5 * 1024 * 1024 * 1024;

pub struct S3Sink {
	client: S3Client,
	bucket: String,
	test_run: bool,
}

impl S3Sink {
	pub fn new(config: &SdkConfig, bucket: impl Into<String>, test_run: bool) -> Self {
		Self {
			client: S3Client::new(config),
			bucket: bucket.into(),
			test_run,
		}
	}

	fn storage_class(&self) -> Option<StorageClass> {
		if self.test_run {
			None
		} else {
			Some(StorageClass::DeepArchive)
		}
	}

	/// Upload `local_path` under a key equal to its own basename.
	#[instrument(skip(self))]
	pub async fn put_object(&self, local_path: &Path) -> Result<()> {
		let key = local_path
			.file_name()
			.and_then(|n| n.to_str())
			.ok_or_else(|| Error::Network(format!("cannot derive key from {}", local_path.display())))?
			.to_string();

		let len = tokio::fs::metadata(local_path)
			.await
			.map_err(|e| Error::filesystem(local_path.to_path_buf(), e))?
			.len();

		if len > SINGLEPART_LIMIT_BYTES {
			self.multipart_put(local_path, &key, len).await
		} else {
			self.singlepart_put(local_path, &key).await
		}
	}

	async fn singlepart_put(&self, local_path: &Path, key: &str) -> Result<()> {
		info!("uploading {} to s3://{}/{}", local_path.display(), self.bucket, key);
		let body = ByteStream::from_path(local_path)
			.await
			.map_err(|e| Error::filesystem(local_path.to_path_buf(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;

		let mut req = self
			.client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(body)
			.checksum_algorithm(ChecksumAlgorithm::Sha256)
			.metadata("Uploader", crate::APP_NAME);
		if let Some(class) = self.storage_class() {
			req = req.storage_class(class);
		}

		req.send().await.map_err(classify_error)?;
		Ok(())
	}

	async fn multipart_put(&self, local_path: &Path, key: &str, len: u64) -> Result<()> {
		let checksum = ChecksumAlgorithm::Sha256;
		let mut create = self
			.client
			.create_multipart_upload()
			.bucket(&self.bucket)
			.key(key)
			.checksum_algorithm(checksum.clone())
			.metadata("Uploader", crate::APP_NAME);
		if let Some(class) = self.storage_class() {
			create = create.storage_class(class);
		}
		let mp = create.send().await.map_err(classify_error)?;
		let Some(upload_id) = mp.upload_id else {
			return Err(Error::Network("no upload ID returned from S3".into()));
		};

		info!(
			"uploading {} ({} bytes) to s3://{}/{} as multipart",
			local_path.display(),
			len,
			self.bucket,
			key
		);

		let part_size = (len / 1_000).max(MINIMUM_MULTIPART_PART_SIZE.get());
		let result = self
			.upload_parts(local_path, key, &upload_id, &checksum, part_size)
			.await;

		match result {
			Ok(parts) => {
				self.client
					.complete_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(&upload_id)
					.multipart_upload(parts.build())
					.send()
					.await
					.map_err(classify_error)?;
				Ok(())
			}
			Err(err) => {
				warn!(?err, "multipart upload failed, aborting");
				let _ = self
					.client
					.abort_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(&upload_id)
					.send()
					.await;
				Err(err)
			}
		}
	}

	async fn upload_parts(
		&self,
		local_path: &Path,
		key: &str,
		upload_id: &str,
		checksum: &ChecksumAlgorithm,
		part_size: u64,
	) -> Result<CompletedMultipartUploadBuilder> {
		let mut file = File::open(local_path)
			.await
			.map_err(|e| Error::filesystem(local_path.to_path_buf(), e))?;

		let mut parts = CompletedMultipartUploadBuilder::default();
		let mut part_number: i32 = 1;
		let mut buf = vec![0u8; part_size as usize];

		loop {
			let mut filled = 0usize;
			while filled < buf.len() {
				let n = file
					.read(&mut buf[filled..])
					.await
					.map_err(|e| Error::filesystem(local_path.to_path_buf(), e))?;
				if n == 0 {
					break;
				}
				filled += n;
			}
			if filled == 0 {
				break;
			}

			debug!(bytes = filled, part_number, "uploading part");
			let upload = self
				.client
				.upload_part()
				.bucket(&self.bucket)
				.key(key)
				.upload_id(upload_id)
				.part_number(part_number)
				.checksum_algorithm(checksum.clone())
				.body(ByteStream::from(buf[..filled].to_vec()))
				.send()
				.await
				.map_err(classify_error)?;

			parts = parts.parts(
				CompletedPart::builder()
					.set_e_tag(upload.e_tag)
					.set_checksum_sha256(upload.checksum_sha256)
					.part_number(part_number)
					.build(),
			);
			part_number += 1;
		}

		Ok(parts)
	}

	/// Whether `key` exists in the bucket. A 404 is treated as "does not exist", not an error.
	pub async fn head_object(&self, key: &str) -> Result<bool> {
		match self.client.head_object().bucket(&self.bucket).key(key).send().await {
			Ok(_) => Ok(true),
			Err(err) => {
				if err
					.as_service_error()
					.map(|e| e.is_not_found())
					.unwrap_or(false)
				{
					Ok(false)
				} else {
					Err(classify_error(err))
				}
			}
		}
	}

	/// Delete `key`. Treats both 200 and 204 responses (i.e. any successful SDK call) as success.
	pub async fn delete_object(&self, key: &str) -> Result<()> {
		self.client
			.delete_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(classify_error)?;
		Ok(())
	}
}

fn classify_error<E, R>(err: aws_sdk_s3::error::SdkError<E, R>) -> Error
where
	E: std::error::Error + 'static,
	R: std::fmt::Debug,
{
	let message = err.to_string();
	if message.to_lowercase().contains("credential") || message.to_lowercase().contains("auth") {
		Error::Auth(message)
	} else {
		Error::Network(message)
	}
}
