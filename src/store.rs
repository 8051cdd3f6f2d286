//! The state store: a single-writer-serialized SQLite database recording every source file's
//! progress through the backup pipeline, the immutable per-run encryption key, and a log of each
//! invocation's command-line arguments.
//!
//! Adapted from `libs/state_db.py`'s `StateDB` class: one mutex around one connection, explicit
//! transactions, and the same three tables (`works`, `runs`, `secrets`).

use std::{
	path::Path,
	sync::Mutex,
};

use chrono::{DateTime, Local, Utc};
use rand::{distributions::Alphanumeric, Rng};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{Error, Result};

/// Length, in bytes, of generated ChaCha20 keys.
pub const ENCRYPT_KEY_LENGTH: usize = 32;

/// The state of a single part (`tar_file`) as it moves through the pipeline.
///
/// Transitions: `Scheduled -> Packaged -> Started -> {Uploaded | Failed}`, and `Failed -> Started`
/// on retry. All rows sharing a `tar_file` move together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
	Scheduled,
	Packaged,
	Started,
	Uploaded,
	Failed,
}

impl WorkStatus {
	fn as_str(self) -> &'static str {
		match self {
			WorkStatus::Scheduled => "SCHEDULED",
			WorkStatus::Packaged => "PACKAGED",
			WorkStatus::Started => "STARTED",
			WorkStatus::Uploaded => "UPLOADED",
			WorkStatus::Failed => "FAILED",
		}
	}

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"SCHEDULED" => WorkStatus::Scheduled,
			"PACKAGED" => WorkStatus::Packaged,
			"STARTED" => WorkStatus::Started,
			"UPLOADED" => WorkStatus::Uploaded,
			"FAILED" => WorkStatus::Failed,
			other => {
				return Err(Error::CorruptDb(rusqlite::Error::InvalidColumnType(
					0,
					format!("status {other:?}"),
					rusqlite::types::Type::Text,
				)))
			}
		})
	}
}

/// One row of the `works` table: a source file and the part it belongs to.
#[derive(Debug, Clone)]
pub struct WorkRecord {
	pub id: i64,
	pub datetime: DateTime<Utc>,
	pub tar_file: String,
	pub filename: String,
	pub modified_time: DateTime<Utc>,
	pub size: u64,
	pub status: WorkStatus,
}

pub struct StateStore {
	conn: Mutex<Connection>,
}

impl StateStore {
	/// Open (creating if absent) the state database at `path`, ensuring its schema exists.
	pub fn open(path: &Path) -> Result<Self> {
		let conn = Connection::open(path)?;
		let store = Self {
			conn: Mutex::new(conn),
		};
		store.create_tables()?;
		Ok(store)
	}

	fn create_tables(&self) -> Result<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS works (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				datetime TEXT NOT NULL,
				tar_file TEXT NOT NULL,
				filename TEXT NOT NULL,
				modified_time TEXT NOT NULL,
				size INTEGER NOT NULL,
				status TEXT NOT NULL
			);
			CREATE TABLE IF NOT EXISTS runs (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				datetime TEXT NOT NULL,
				cmd_args_json TEXT NOT NULL
			);
			CREATE TABLE IF NOT EXISTS secrets (
				encryption_key BLOB
			);",
		)?;
		Ok(())
	}

	/// Record the arguments this invocation was run with, as a JSON blob, for audit purposes.
	pub fn record_run(&self, cmd_args: &impl Serialize) -> Result<()> {
		let json = serde_json::to_string(cmd_args).map_err(|e| {
			Error::CorruptDb(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
		})?;
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT INTO runs (datetime, cmd_args_json) VALUES (?1, ?2)",
			params![Utc::now().to_rfc3339(), json],
		)?;
		Ok(())
	}

	/// The JSON blob of the most recent run's arguments, if any runs have been recorded.
	pub fn get_last_cmd_args(&self) -> Result<Option<String>> {
		let conn = self.conn.lock().unwrap();
		Ok(conn
			.query_row(
				"SELECT cmd_args_json FROM runs ORDER BY id DESC LIMIT 1",
				[],
				|row| row.get(0),
			)
			.optional()?)
	}

	/// Fetch the database's encryption key, generating and persisting one on first use.
	///
	/// The key is immutable once generated: every subsequent call returns the same bytes.
	pub fn get_or_create_encryption_key(&self) -> Result<Vec<u8>> {
		let mut conn = self.conn.lock().unwrap();
		let tx = conn.transaction()?;
		let existing: Option<Vec<u8>> = tx
			.query_row("SELECT encryption_key FROM secrets LIMIT 1", [], |row| {
				row.get(0)
			})
			.optional()?;
		let key = if let Some(key) = existing {
			key
		} else {
			let key: Vec<u8> = rand::thread_rng()
				.sample_iter(&Alphanumeric)
				.take(ENCRYPT_KEY_LENGTH)
				.collect();
			tx.execute("INSERT INTO secrets (encryption_key) VALUES (?1)", params![key])?;
			key
		};
		tx.commit()?;
		Ok(key)
	}

	/// Record a newly-discovered source file as `SCHEDULED`, belonging to `tar_file`.
	pub fn record_scheduled(
		&self,
		tar_file: &str,
		filename: &str,
		modified_time: DateTime<Utc>,
		size: u64,
	) -> Result<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT INTO works (datetime, tar_file, filename, modified_time, size, status)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
			params![
				Utc::now().to_rfc3339(),
				tar_file,
				filename,
				modified_time.to_rfc3339(),
				size,
				WorkStatus::Scheduled.as_str(),
			],
		)?;
		Ok(())
	}

	/// Transition every row belonging to `tar_file` to `status`.
	///
	/// This is how `PACKAGED`/`STARTED`/`UPLOADED`/`FAILED` are recorded: per-part, not per-file.
	pub fn set_status(&self, tar_file: &str, status: WorkStatus) -> Result<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"UPDATE works SET datetime = ?1, status = ?2 WHERE tar_file = ?3",
			params![Utc::now().to_rfc3339(), status.as_str(), tar_file],
		)?;
		Ok(())
	}

	/// Distinct part names currently `UPLOADED`.
	pub fn uploaded_part_names(&self) -> Result<Vec<String>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(
			"SELECT DISTINCT tar_file FROM works WHERE status = ?1 ORDER BY tar_file",
		)?;
		let rows = stmt
			.query_map(params![WorkStatus::Uploaded.as_str()], |row| row.get(0))?
			.collect::<rusqlite::Result<Vec<String>>>()?;
		Ok(rows)
	}

	/// Absolute source paths of files already `UPLOADED`, for resumption's skip check.
	pub fn uploaded_filenames(&self) -> Result<Vec<String>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt =
			conn.prepare("SELECT filename FROM works WHERE status = ?1")?;
		let rows = stmt
			.query_map(params![WorkStatus::Uploaded.as_str()], |row| row.get(0))?
			.collect::<rusqlite::Result<Vec<String>>>()?;
		Ok(rows)
	}

	/// Distinct part names left in `PACKAGED` from a prior, interrupted run.
	pub fn packaged_part_names(&self) -> Result<Vec<String>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(
			"SELECT DISTINCT tar_file FROM works WHERE status = ?1 ORDER BY tar_file",
		)?;
		let rows = stmt
			.query_map(params![WorkStatus::Packaged.as_str()], |row| row.get(0))?
			.collect::<rusqlite::Result<Vec<String>>>()?;
		Ok(rows)
	}

	/// All work records, for the `show` command's uncollated view.
	pub fn all_records(&self) -> Result<Vec<WorkRecord>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(
			"SELECT id, datetime, tar_file, filename, modified_time, size, status FROM works ORDER BY id",
		)?;
		let rows = stmt.query_map([], |row| {
			let datetime: String = row.get(1)?;
			let modified_time: String = row.get(4)?;
			let status: String = row.get(6)?;
			Ok((
				row.get::<_, i64>(0)?,
				datetime,
				row.get::<_, String>(2)?,
				row.get::<_, String>(3)?,
				modified_time,
				row.get::<_, i64>(5)?,
				status,
			))
		})?;

		let mut out = Vec::new();
		for row in rows {
			let (id, datetime, tar_file, filename, modified_time, size, status) = row?;
			out.push(WorkRecord {
				id,
				datetime: DateTime::parse_from_rfc3339(&datetime)
					.map(|d| d.with_timezone(&Utc))
					.unwrap_or_else(|_| Utc::now()),
				tar_file,
				filename,
				modified_time: DateTime::parse_from_rfc3339(&modified_time)
					.map(|d| d.with_timezone(&Utc))
					.unwrap_or_else(|_| Utc::now()),
				size: size as u64,
				status: WorkStatus::from_str(&status)?,
			});
		}
		Ok(out)
	}

	/// Delete every row belonging to `tar_file` (used by `delete` after confirming the object
	/// store no longer has the part).
	pub fn delete_work_record(&self, tar_file: &str) -> Result<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute("DELETE FROM works WHERE tar_file = ?1", params![tar_file])?;
		Ok(())
	}

	/// Delete every row in `works` (used by `delete --all`, once every part has been confirmed
	/// deleted from the object store).
	pub fn delete_all_work_records(&self) -> Result<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute("DELETE FROM works", [])?;
		Ok(())
	}
}

/// Render a UTC timestamp for display purposes in the local timezone.
pub fn to_local(dt: DateTime<Utc>) -> DateTime<Local> {
	dt.with_timezone(&Local)
}
