//! Backup & rollback store.
//!
//! Every mutation of a test file is preceded by a snapshot of what was there
//! before (or a tombstone when the file did not exist). Snapshots accumulate
//! in `backup_dir` and are indexed in an append-only `index.jsonl`; nothing
//! here deletes them except the explicit [`BackupManager::prune`].
//!
//! Snapshots are grouped into sessions. Within a session a path is snapshotted
//! once, before its first write, so the session's snapshot is always the
//! pre-session content and `rollback_all` restores it byte-for-byte.

use crate::error::CapabilityError;
use crate::util::write_atomic;
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const INDEX_FILE: &str = "index.jsonl";

pub type SessionId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub session: SessionId,
    /// Absolute path of the file that was about to be mutated.
    pub original: PathBuf,
    /// Snapshot location; `None` marks a tombstone (no prior file).
    pub backup_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn is_tombstone(&self) -> bool {
        self.backup_path.is_none()
    }
}

#[derive(Debug, Default)]
struct SessionLog {
    /// Paths in order of first mutation.
    touched: Vec<PathBuf>,
    /// Path -> index into `BackupManager::records`.
    snapshots: HashMap<PathBuf, usize>,
}

#[derive(Debug)]
pub struct BackupManager {
    store_dir: PathBuf,
    records: Vec<BackupRecord>,
    sessions: HashMap<SessionId, SessionLog>,
}

impl BackupManager {
    /// Open (or create) the store, loading the on-disk index.
    pub fn open(store_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(store_dir).with_context(|| {
            format!("Failed to create backup directory {}", store_dir.display())
        })?;

        let mut records = Vec::new();
        let index = store_dir.join(INDEX_FILE);
        if let Ok(content) = fs::read_to_string(&index) {
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<BackupRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(err) => tracing::warn!(
                        line = line_no + 1,
                        error = %err,
                        "skipping unreadable backup index entry"
                    ),
                }
            }
        }

        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            records,
            sessions: HashMap::new(),
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn begin_session(&mut self) -> SessionId {
        let id = Uuid::new_v4();
        self.sessions.insert(id, SessionLog::default());
        tracing::debug!(session = %id, "backup session started");
        id
    }

    /// Snapshot `path` before its first mutation in `session`.
    ///
    /// Later calls for the same path in the same session return the original
    /// record untouched: the first snapshot is the session's rollback target.
    pub fn snapshot(
        &mut self,
        session: SessionId,
        path: &Path,
    ) -> Result<BackupRecord, CapabilityError> {
        if let Some(&idx) = self
            .sessions
            .get(&session)
            .and_then(|log| log.snapshots.get(path))
        {
            return Ok(self.records[idx].clone());
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let backup_path = match fs::read(path) {
            Ok(bytes) => {
                let target = self.store_dir.join(snapshot_file_name(path, created_at, id));
                write_atomic(&target, &bytes).map_err(|e| CapabilityError::io(&target, e))?;
                Some(target)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(CapabilityError::io(path, err)),
        };

        let record = BackupRecord {
            id,
            session,
            original: path.to_path_buf(),
            backup_path,
            created_at,
        };
        self.append_index(&record)?;

        self.records.push(record.clone());
        let idx = self.records.len() - 1;
        let log = self.sessions.entry(session).or_default();
        log.touched.push(path.to_path_buf());
        log.snapshots.insert(path.to_path_buf(), idx);

        tracing::info!(
            path = %path.display(),
            tombstone = record.is_tombstone(),
            "backup created"
        );
        Ok(record)
    }

    /// Restore the most recent snapshot of `path`.
    pub fn rollback(&self, path: &Path) -> Result<BackupRecord, CapabilityError> {
        let record = self
            .records
            .iter()
            .rev()
            .find(|r| r.original == path)
            .ok_or_else(|| {
                tracing::error!(path = %path.display(), "rollback requested without a snapshot");
                CapabilityError::NoSnapshot {
                    path: path.to_path_buf(),
                }
            })?;
        self.restore_record(record)?;
        Ok(record.clone())
    }

    /// Restore every path touched in `session`, newest mutation first.
    pub fn rollback_all(&self, session: SessionId) -> Result<Vec<PathBuf>, CapabilityError> {
        let Some(log) = self.sessions.get(&session) else {
            return Ok(Vec::new());
        };
        let mut restored = Vec::with_capacity(log.touched.len());
        for path in log.touched.iter().rev() {
            let idx = log.snapshots.get(path).copied().ok_or_else(|| {
                tracing::error!(path = %path.display(), "session lost track of its snapshot");
                CapabilityError::NoSnapshot { path: path.clone() }
            })?;
            self.restore_record(&self.records[idx])?;
            restored.push(path.clone());
        }
        Ok(restored)
    }

    pub fn touched(&self, session: SessionId) -> &[PathBuf] {
        self.sessions
            .get(&session)
            .map(|log| log.touched.as_slice())
            .unwrap_or(&[])
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    /// Oldest snapshot of `path`, i.e. its content before any recorded edit.
    pub fn earliest_for(&self, path: &Path) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.original == path)
    }

    /// Find a record by its snapshot file name or full snapshot path.
    pub fn find_by_backup(&self, backup: &str) -> Option<&BackupRecord> {
        self.records.iter().rev().find(|r| {
            r.backup_path.as_ref().is_some_and(|p| {
                p == Path::new(backup)
                    || p.file_name().map(|n| n.to_string_lossy() == backup) == Some(true)
            })
        })
    }

    /// Put the file back the way the record saw it.
    pub fn restore_record(&self, record: &BackupRecord) -> Result<(), CapabilityError> {
        match &record.backup_path {
            Some(backup) => {
                let bytes = fs::read(backup).map_err(|e| CapabilityError::io(backup, e))?;
                write_atomic(&record.original, &bytes)
                    .map_err(|e| CapabilityError::io(&record.original, e))?;
            }
            None => match fs::remove_file(&record.original) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(CapabilityError::io(&record.original, err)),
            },
        }
        tracing::info!(path = %record.original.display(), "restored from backup");
        Ok(())
    }

    /// Delete every snapshot and the index. Returns the number of snapshot
    /// files removed.
    pub fn prune(&mut self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for record in &self.records {
            if let Some(path) = &record.backup_path {
                match fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("Failed to remove backup {}", path.display())
                        })
                    }
                }
            }
        }
        let index = self.store_dir.join(INDEX_FILE);
        if index.exists() {
            fs::remove_file(&index)
                .with_context(|| format!("Failed to remove {}", index.display()))?;
        }
        self.records.clear();
        self.sessions.clear();
        Ok(removed)
    }

    fn append_index(&self, record: &BackupRecord) -> Result<(), CapabilityError> {
        let index = self.store_dir.join(INDEX_FILE);
        let mut line = serde_json::to_string(record).map_err(|e| CapabilityError::Io {
            path: index.display().to_string(),
            message: e.to_string(),
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .map_err(|e| CapabilityError::io(&index, e))?;
        file.lock_exclusive()
            .map_err(|e| CapabilityError::io(&index, e))?;
        let written = file.write_all(line.as_bytes());
        let _ = FileExt::unlock(&file);
        written.map_err(|e| CapabilityError::io(&index, e))
    }
}

/// `test_users.backup.20260130_123456_123456-1a2b3c4d.py`
fn snapshot_file_name(original: &Path, at: DateTime<Utc>, id: Uuid) -> String {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let ext = original
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let short_id: String = id.simple().to_string().chars().take(8).collect();
    format!(
        "{}.backup.{}-{}{}",
        stem,
        at.format("%Y%m%d_%H%M%S_%6f"),
        short_id,
        ext
    )
}
