use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions, TryLockError},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::models::{RecordPatch, SubmissionRecord, SyncStatus};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup log i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode backup entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record {0} already exists")]
    Duplicate(String),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("backup log {} is held by another process", .0.display())]
    Locked(PathBuf),
}

pub type BackupResult<T> = Result<T, BackupError>;

impl From<BackupError> for SyncError {
    fn from(value: BackupError) -> Self {
        SyncError::BackupWrite(value.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Append {
        record: SubmissionRecord,
    },
    Update {
        request_id: String,
        patch: RecordPatch,
    },
    Delete {
        request_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub sync_status: Option<SyncStatus>,
}

struct Inner {
    file: File,
    records: IndexMap<String, SubmissionRecord>,
    // Released when the last clone of the store is dropped.
    _lock: File,
}

/// Append-only JSON Lines log of every submission and its sync progress.
///
/// The log is replayed into memory on open; each write is fsynced before the
/// in-memory view changes. Attachment bytes are kept in a spool directory
/// until they reach remote storage.
///
/// One process owns the log at a time: `open` takes an exclusive lock on a
/// `<log>.lock` sidecar and fails with [`BackupError::Locked`] while another
/// store holds it.
#[derive(Clone)]
pub struct BackupStore {
    inner: Arc<Mutex<Inner>>,
    spool_dir: PathBuf,
}

impl BackupStore {
    pub fn open(path: impl Into<PathBuf>, spool_dir: impl Into<PathBuf>) -> BackupResult<Self> {
        let path = path.into();
        let spool_dir = spool_dir.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&spool_dir)?;

        let lock = acquire_lock(&path)?;
        let Replay { records, valid_len } = replay(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "truncating incomplete trailing backup entry"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        info!(
            path = %path.display(),
            records = records.len(),
            "backup store opened"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                file,
                records,
                _lock: lock,
            })),
            spool_dir,
        })
    }

    pub fn append_record(&self, record: &SubmissionRecord) -> BackupResult<()> {
        let mut inner = self.lock();
        if inner.records.contains_key(&record.request_id) {
            return Err(BackupError::Duplicate(record.request_id.clone()));
        }
        write_entry(
            &mut inner.file,
            &LogEntry::Append {
                record: record.clone(),
            },
        )?;
        inner
            .records
            .insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    /// Applies `patch` and returns the resulting record. A patch that changes
    /// nothing is not written again.
    pub fn update_record(
        &self,
        request_id: &str,
        patch: &RecordPatch,
    ) -> BackupResult<SubmissionRecord> {
        let mut inner = self.lock();
        let current = inner
            .records
            .get(request_id)
            .ok_or_else(|| BackupError::NotFound(request_id.to_string()))?;

        let mut updated = current.clone();
        patch.apply(&mut updated);
        if updated == *current {
            return Ok(updated);
        }

        write_entry(
            &mut inner.file,
            &LogEntry::Update {
                request_id: request_id.to_string(),
                patch: patch.clone(),
            },
        )?;
        inner
            .records
            .insert(request_id.to_string(), updated.clone());
        Ok(updated)
    }

    pub fn get(&self, request_id: &str) -> Option<SubmissionRecord> {
        self.lock().records.get(request_id).cloned()
    }

    pub fn list_records(&self, filter: &RecordFilter) -> Vec<SubmissionRecord> {
        self.lock()
            .records
            .values()
            .filter(|record| {
                filter
                    .sync_status
                    .map_or(true, |status| record.sync_status == status)
            })
            .cloned()
            .collect()
    }

    /// Records not yet in the spreadsheet whose last attempt (or creation,
    /// when never attempted) predates `older_than`.
    pub fn list_unsynced(&self, older_than: DateTime<Utc>) -> Vec<SubmissionRecord> {
        self.lock()
            .records
            .values()
            .filter(|record| record.sync_status != SyncStatus::Synced)
            .filter(|record| is_stale(record, older_than))
            .cloned()
            .collect()
    }

    /// Synced records that still have an attachment to transfer from the spool.
    pub fn list_attachment_retries(&self, older_than: DateTime<Utc>) -> Vec<SubmissionRecord> {
        let records: Vec<SubmissionRecord> = self
            .lock()
            .records
            .values()
            .filter(|record| record.sync_status == SyncStatus::Synced)
            .filter(|record| record.has_retryable_attachments())
            .filter(|record| is_stale(record, older_than))
            .cloned()
            .collect();

        records
            .into_iter()
            .filter(|record| {
                record.attachments.iter().any(|attachment| {
                    self.spool_path(&record.request_id, &attachment.stored_name)
                        .exists()
                })
            })
            .collect()
    }

    /// Administrative removal; also drops spooled attachments of those records.
    pub fn delete_records(&self, request_ids: &[String]) -> BackupResult<usize> {
        let mut inner = self.lock();
        let present: Vec<String> = request_ids
            .iter()
            .filter(|id| inner.records.contains_key(id.as_str()))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        write_entry(
            &mut inner.file,
            &LogEntry::Delete {
                request_ids: present.clone(),
            },
        )?;
        for id in &present {
            inner.records.shift_remove(id);
        }
        drop(inner);

        for id in &present {
            let dir = self.spool_dir.join(id);
            if let Err(err) = fs::remove_dir_all(&dir) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(request_id = %id, error = %err, "failed to remove spooled attachments");
                }
            }
        }
        info!(deleted = present.len(), "backup records deleted");
        Ok(present.len())
    }

    pub fn spool_attachment(
        &self,
        request_id: &str,
        stored_name: &str,
        content: &[u8],
    ) -> BackupResult<()> {
        let dir = self.spool_dir.join(request_id);
        fs::create_dir_all(&dir)?;
        let mut file = File::create(dir.join(stored_name))?;
        file.write_all(content)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn read_spooled(&self, request_id: &str, stored_name: &str) -> BackupResult<Option<Bytes>> {
        match fs::read(self.spool_path(request_id, stored_name)) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn remove_spooled(&self, request_id: &str, stored_name: &str) -> BackupResult<()> {
        match fs::remove_file(self.spool_path(request_id, stored_name)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let dir = self.spool_dir.join(request_id);
        if fs::read_dir(&dir).map(|mut entries| entries.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(&dir);
        }
        Ok(())
    }

    fn spool_path(&self, request_id: &str, stored_name: &str) -> PathBuf {
        self.spool_dir.join(request_id).join(stored_name)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_stale(record: &SubmissionRecord, older_than: DateTime<Utc>) -> bool {
    record.last_sync_attempt.unwrap_or(record.timestamp) < older_than
}

fn acquire_lock(path: &Path) -> BackupResult<File> {
    let mut lock_path = OsString::from(path.as_os_str());
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    match lock.try_lock() {
        Ok(()) => Ok(lock),
        Err(TryLockError::WouldBlock) => Err(BackupError::Locked(path.to_path_buf())),
        Err(TryLockError::Error(err)) => Err(err.into()),
    }
}

/// Appends one entry. A failed write is cut back off so the next entry starts
/// on a fresh line.
fn write_entry(file: &mut File, entry: &LogEntry) -> BackupResult<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let len = file.metadata()?.len();
    if let Err(err) = file.write_all(&line).and_then(|()| file.sync_data()) {
        if let Err(truncate_err) = file.set_len(len) {
            warn!(error = %truncate_err, "failed to roll back partial backup entry");
        }
        return Err(err.into());
    }
    Ok(())
}

struct Replay {
    records: IndexMap<String, SubmissionRecord>,
    /// Length of the log up to its last complete line.
    valid_len: u64,
}

fn replay(path: &Path) -> BackupResult<Replay> {
    let mut records = IndexMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Replay {
                records,
                valid_len: 0,
            })
        }
        Err(err) => return Err(err.into()),
    };

    let mut reader = BufReader::new(file);
    let mut valid_len = 0u64;
    let mut buf = Vec::new();
    for line_no in 1u64.. {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            warn!(line = line_no, "incomplete trailing backup entry ignored");
            break;
        }
        valid_len += read as u64;

        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(LogEntry::Append { record }) => {
                records.insert(record.request_id.clone(), record);
            }
            Ok(LogEntry::Update { request_id, patch }) => match records.get_mut(&request_id) {
                Some(record) => patch.apply(record),
                None => warn!(line = line_no, %request_id, "update for unknown record skipped"),
            },
            Ok(LogEntry::Delete { request_ids }) => {
                for id in request_ids {
                    records.shift_remove(&id);
                }
            }
            Err(err) => {
                warn!(line = line_no, error = %err, "unreadable backup entry skipped");
            }
        }
    }
    Ok(Replay { records, valid_len })
}
