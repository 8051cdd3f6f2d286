//! The Worker Pool: bounded-concurrency task execution for uploads and decrypts, with per-task
//! retry and a produce-ahead submission buffer.
//!
//! Adapted from `libs/worker_pool.py`'s `WorkerPool`, which wraps a `ThreadPoolExecutor(N)` with
//! a `BoundedSemaphore(N + NUM_WORKS_PRODUCE_AHEAD)` gating submission. Here the same shape is
//! built from two `tokio::sync::Semaphore`s: `submit_semaphore` has `N+K` permits and is held for
//! a task's entire lifetime including retries (this is what makes the produce-ahead bound work),
//! while `exec_semaphore` has `N` permits and is acquired only around the actual upload/decrypt
//! attempt, bounding real concurrent network/file-system work to `N`.

use std::{ops::RangeInclusive, path::PathBuf, sync::Arc};

use rand::Rng;
use tokio::{sync::Semaphore, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	aws::S3Sink,
	crypto::PartCipher,
	error::Result,
	store::{StateStore, WorkStatus},
};

/// One unit of work the pool executes, with its own retry loop.
pub enum Task {
	Upload {
		tar_file: String,
		local_path: PathBuf,
		autoclean: bool,
	},
	Decrypt {
		tar_file: String,
		ciphertext_path: PathBuf,
		output_path: PathBuf,
		autoclean: bool,
	},
}

impl Task {
	fn tar_file(&self) -> &str {
		match self {
			Task::Upload { tar_file, .. } => tar_file,
			Task::Decrypt { tar_file, .. } => tar_file,
		}
	}
}

pub struct WorkerPool {
	store: Arc<StateStore>,
	sink: Option<Arc<S3Sink>>,
	submit_semaphore: Arc<Semaphore>,
	exec_semaphore: Arc<Semaphore>,
	retry_wait_mins: RangeInclusive<u64>,
	cancel: CancellationToken,
	handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
	pub fn new(
		store: Arc<StateStore>,
		sink: Option<Arc<S3Sink>>,
		num_workers: usize,
		produce_ahead: usize,
		retry_wait_mins: RangeInclusive<u64>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			store,
			sink,
			submit_semaphore: Arc::new(Semaphore::new(num_workers + produce_ahead)),
			exec_semaphore: Arc::new(Semaphore::new(num_workers)),
			retry_wait_mins,
			cancel,
			handles: Vec::new(),
		}
	}

	/// Submit a task. Blocks (asynchronously) until the produce-ahead buffer has room.
	pub async fn submit(&mut self, task: Task) {
		let submit_permit = self.submit_semaphore.clone().acquire_owned().await.expect("semaphore not closed");
		let exec_semaphore = self.exec_semaphore.clone();
		let store = self.store.clone();
		let sink = self.sink.clone();
		let retry_wait_mins = self.retry_wait_mins.clone();
		let cancel = self.cancel.clone();

		let handle = tokio::spawn(async move {
			let _submit_permit = submit_permit;
			run_task_with_retry(task, store, sink, exec_semaphore, retry_wait_mins, cancel).await;
		});
		self.handles.push(handle);
	}

	/// Block until every submitted task (including retries) has finished.
	pub async fn wait_on_all_tasks(&mut self) -> Result<()> {
		for handle in self.handles.drain(..) {
			if let Err(err) = handle.await {
				warn!(?err, "a worker task panicked");
			}
		}
		Ok(())
	}
}

async fn run_task_with_retry(
	task: Task,
	store: Arc<StateStore>,
	sink: Option<Arc<S3Sink>>,
	exec_semaphore: Arc<Semaphore>,
	retry_wait_mins: RangeInclusive<u64>,
	cancel: CancellationToken,
) {
	let tar_file = task.tar_file().to_string();
	// Only UPLOAD tasks participate in the works-table state machine; DECRYPT tasks operate on
	// parts that are already UPLOADED and just need the retry/backoff machinery.
	let tracks_status = matches!(task, Task::Upload { .. });

	loop {
		if cancel.is_cancelled() {
			debug!(tar_file, "cancelled before starting, abandoning task");
			return;
		}

		if tracks_status {
			if let Err(err) = store.set_status(&tar_file, WorkStatus::Started) {
				warn!(?err, tar_file, "failed to record STARTED, abandoning task");
				return;
			}
		}

		let permit = exec_semaphore.clone().acquire_owned().await.expect("semaphore not closed");
		let result = execute(&task, &store, sink.as_deref()).await;
		drop(permit);

		match result {
			Ok(()) => {
				if tracks_status {
					if let Err(err) = store.set_status(&tar_file, WorkStatus::Uploaded) {
						warn!(?err, tar_file, "failed to record UPLOADED");
					}
				}
				info!(tar_file, "task completed");
				return;
			}
			Err(err) if cancel.is_cancelled() => {
				debug!(?err, tar_file, "task failed during cancellation, not retrying");
				return;
			}
			Err(err) if !err.is_recoverable() => {
				warn!(?err, tar_file, "unrecoverable error, abandoning task without retry");
				if tracks_status {
					if let Err(err) = store.set_status(&tar_file, WorkStatus::Failed) {
						warn!(?err, tar_file, "failed to record FAILED");
					}
				}
				return;
			}
			Err(err) => {
				warn!(?err, tar_file, "task failed, will retry");
				if tracks_status {
					if let Err(err) = store.set_status(&tar_file, WorkStatus::Failed) {
						warn!(?err, tar_file, "failed to record FAILED");
					}
				}

				let wait_mins = rand::thread_rng().gen_range(retry_wait_mins.clone());
				tokio::select! {
					_ = sleep(std::time::Duration::from_secs(wait_mins * 60)) => {}
					_ = cancel.cancelled() => {
						debug!(tar_file, "cancelled during backoff, abandoning task");
						return;
					}
				}
			}
		}
	}
}

async fn execute(task: &Task, store: &StateStore, sink: Option<&S3Sink>) -> Result<()> {
	match task {
		Task::Upload {
			local_path,
			autoclean,
			..
		} => {
			let sink = sink.ok_or_else(|| {
				crate::error::Error::Network("upload task submitted without an S3 sink".into())
			})?;
			sink.put_object(local_path).await?;
			if *autoclean {
				let _ = std::fs::remove_file(local_path);
			}
			Ok(())
		}
		Task::Decrypt {
			ciphertext_path,
			output_path,
			autoclean,
			..
		} => {
			decrypt_file(store, ciphertext_path, output_path).await?;
			if *autoclean {
				let _ = std::fs::remove_file(ciphertext_path);
			}
			Ok(())
		}
	}
}

/// Stream-decrypt `ciphertext_path` into `output_path` in fixed-size blocks, using the key from
/// the state store and a nonce derived from the ciphertext's own basename.
async fn decrypt_file(
	store: &StateStore,
	ciphertext_path: &std::path::Path,
	output_path: &std::path::Path,
) -> Result<()> {
	use std::io::{Read, Write};

	const BLOCK_SIZE: usize = 64 * 1024;

	let key = store.get_or_create_encryption_key()?;
	let basename = ciphertext_path
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or_default();
	let mut cipher = PartCipher::new(&key, basename);

	let mut input = std::fs::File::open(ciphertext_path)
		.map_err(|e| crate::error::Error::filesystem(ciphertext_path.to_path_buf(), e))?;
	let mut output = std::fs::File::create(output_path)
		.map_err(|e| crate::error::Error::filesystem(output_path.to_path_buf(), e))?;

	let mut buf = vec![0u8; BLOCK_SIZE];
	loop {
		let n = input
			.read(&mut buf)
			.map_err(|e| crate::error::Error::filesystem(ciphertext_path.to_path_buf(), e))?;
		if n == 0 {
			break;
		}
		cipher.apply(&mut buf[..n]);
		output
			.write_all(&buf[..n])
			.map_err(|e| crate::error::Error::filesystem(output_path.to_path_buf(), e))?;
	}
	Ok(())
}
