use crate::budget::types::{RecordKey, StoreError, SyncCursor, SyncRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const RECORDS_FILE: &str = "sync_records.jsonl";
const CURSORS_FILE: &str = "sync_cursors.json";
const STATE_VERSION: u32 = 1;
/// Superseded log lines tolerated before the record log is rewritten on load.
const COMPACT_AFTER_SUPERSEDED: usize = 64;

/// Repository for sync record persistence
///
/// Records are only ever added or updated, so storage is a log: `append` persists new versions
/// and `load` returns the latest version of each record.
#[async_trait::async_trait]
pub trait SyncRecordRepository: Send + Sync {
	async fn load(&self) -> Result<Vec<SyncRecord>, StoreError>;
	async fn append(&self, records: &[SyncRecord]) -> Result<(), StoreError>;
}

/// Repository for per-account fetch cursors
#[async_trait::async_trait]
pub trait CursorRepository: Send + Sync {
	async fn load(&self) -> Result<HashMap<String, SyncCursor>, StoreError>;
	async fn save(&self, cursors: &HashMap<String, SyncCursor>) -> Result<(), StoreError>;
}

/// On-disk envelope of the cursor file.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile<T> {
	version: u32,
	saved_at: DateTime<Utc>,
	data: T,
}

/// Write `value` to `path` through a temporary file so a crash never leaves a torn file behind.
async fn write_state<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}

	let envelope = StateFile {
		version: STATE_VERSION,
		saved_at: Utc::now(),
		data: value,
	};
	let content = serde_json::to_vec_pretty(&envelope)?;

	let tmp_path = path.with_extension("json.tmp");
	tokio::fs::write(&tmp_path, &content).await?;
	tokio::fs::rename(&tmp_path, path).await?;
	Ok(())
}

async fn read_state<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
	let content = match tokio::fs::read(path).await {
		Ok(content) => content,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e.into()),
	};
	let envelope: StateFile<T> = serde_json::from_slice(&content)?;
	debug!(
		"Read {:?} (version {}, saved at {})",
		path, envelope.version, envelope.saved_at
	);
	Ok(Some(envelope.data))
}

/// Collapse a record log to the latest version of each record, in first-seen order.
fn latest_per_key(log: Vec<SyncRecord>) -> Vec<SyncRecord> {
	let mut positions: HashMap<RecordKey, usize> = HashMap::new();
	let mut records: Vec<SyncRecord> = Vec::new();
	for record in log {
		match positions.get(&record.key()) {
			Some(&position) => records[position] = record,
			None => {
				positions.insert(record.key(), records.len());
				records.push(record);
			}
		}
	}
	records
}

fn to_lines(records: &[SyncRecord]) -> Result<Vec<u8>, StoreError> {
	let mut content = Vec::new();
	for record in records {
		serde_json::to_writer(&mut content, record)?;
		content.push(b'\n');
	}
	Ok(content)
}

/// JSON-lines implementation of SyncRecordRepository
pub struct FileSyncRecordRepository {
	path: PathBuf,
}

impl FileSyncRecordRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			path: data_dir.join(RECORDS_FILE),
		}
	}

	/// Rewrite the log with one line per record.
	async fn compact(&self, records: &[SyncRecord]) -> Result<(), StoreError> {
		let content = to_lines(records)?;
		let tmp_path = self.path.with_extension("jsonl.tmp");
		tokio::fs::write(&tmp_path, &content).await?;
		tokio::fs::rename(&tmp_path, &self.path).await?;
		info!("Compacted {:?} to {} records", self.path, records.len());
		Ok(())
	}

	/// Drop a partial final line left by an interrupted append.
	async fn truncate(&self, len: usize) -> Result<(), StoreError> {
		let file = tokio::fs::OpenOptions::new()
			.write(true)
			.open(&self.path)
			.await?;
		file.set_len(len as u64).await?;
		file.sync_data().await?;
		Ok(())
	}
}

#[async_trait::async_trait]
impl SyncRecordRepository for FileSyncRecordRepository {
	async fn load(&self) -> Result<Vec<SyncRecord>, StoreError> {
		let content = match tokio::fs::read(&self.path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				info!("No sync records at {:?}, starting empty", self.path);
				return Ok(Vec::new());
			}
			Err(e) => return Err(e.into()),
		};

		let mut log = Vec::new();
		let mut offset = 0;
		for line in content.split_inclusive(|byte| *byte == b'\n') {
			let complete = line.ends_with(b"\n");
			let body = line.trim_ascii();
			if !body.is_empty() {
				match serde_json::from_slice::<SyncRecord>(body) {
					Ok(record) => log.push(record),
					Err(e) if !complete => {
						warn!(
							"Ignoring partial last line of {:?} ({} bytes): {}",
							self.path,
							line.len(),
							e
						);
						self.truncate(offset).await?;
						break;
					}
					Err(e) => return Err(e.into()),
				}
				if !complete {
					// Whole record but no newline; terminate it so the next append starts clean.
					self.append_bytes(b"\n").await?;
				}
			}
			offset += line.len();
		}

		let lines = log.len();
		let records = latest_per_key(log);
		info!("Loaded {} sync records from {:?}", records.len(), self.path);
		if lines - records.len() >= COMPACT_AFTER_SUPERSEDED {
			self.compact(&records).await?;
		}
		Ok(records)
	}

	async fn append(&self, records: &[SyncRecord]) -> Result<(), StoreError> {
		if records.is_empty() {
			return Ok(());
		}
		self.append_bytes(&to_lines(records)?).await?;
		debug!("Appended {} sync records to {:?}", records.len(), self.path);
		Ok(())
	}
}

impl FileSyncRecordRepository {
	async fn append_bytes(&self, content: &[u8]) -> Result<(), StoreError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await?;
		file.write_all(content).await?;
		file.sync_data().await?;
		Ok(())
	}
}

/// File-based implementation of CursorRepository
pub struct FileCursorRepository {
	path: PathBuf,
}

impl FileCursorRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			path: data_dir.join(CURSORS_FILE),
		}
	}
}

#[async_trait::async_trait]
impl CursorRepository for FileCursorRepository {
	async fn load(&self) -> Result<HashMap<String, SyncCursor>, StoreError> {
		Ok(read_state(&self.path).await?.unwrap_or_default())
	}

	async fn save(&self, cursors: &HashMap<String, SyncCursor>) -> Result<(), StoreError> {
		write_state(&self.path, cursors).await?;
		debug!("Saved {} cursors to {:?}", cursors.len(), self.path);
		Ok(())
	}
}
