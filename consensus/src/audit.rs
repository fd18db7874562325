//! Append-only audit trail of every attempt.
//!
//! The executor emits one [`AuditRecord`] per attempt as soon as the attempt
//! completes, valid or not, so a crash during aggregation loses nothing.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Attempt;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit sink lock poisoned")]
    Poisoned,
}

pub type AuditResult<T> = Result<T, AuditError>;

/// One attempt, keyed by unit id and attempt index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub unit_id: String,
    pub attempt_index: u32,
    pub recorded_at: DateTime<Utc>,
    pub attempt: Attempt,
}

impl AuditRecord {
    pub fn new(unit_id: impl Into<String>, attempt: Attempt) -> Self {
        Self {
            unit_id: unit_id.into(),
            attempt_index: attempt.index(),
            recorded_at: Utc::now(),
            attempt,
        }
    }
}

/// Destination for audit records. Must be append-only.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> AuditResult<()>;
}

/// Keeps records in memory. Default sink when none is configured.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far, in arrival order.
    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.records.lock() {
            Ok(records) => records.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records for one unit, ordered by attempt index.
    pub fn records_for(&self, unit_id: &str) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = self
            .records()
            .into_iter()
            .filter(|r| r.unit_id == unit_id)
            .collect();
        records.sort_by_key(|r| r.attempt_index);
        records
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> AuditResult<()> {
        self.records
            .lock()
            .map_err(|_| AuditError::Poisoned)?
            .push(record.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
///
/// The file is opened in append mode for every write; the mutex only keeps
/// concurrent lines from interleaving.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    /// Sink writing to `path`. Parent directories are created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back. A missing file yields an empty list.
    pub fn read_all(&self) -> AuditResult<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> AuditResult<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.lock.lock().map_err(|_| AuditError::Poisoned)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttemptErrorKind;

    fn failed(index: u32) -> Attempt {
        Attempt::failed(index, AttemptErrorKind::Timeout, "no answer", 1)
    }

    #[test]
    fn test_memory_sink_orders_records_per_unit() {
        let sink = MemoryAuditSink::new();
        sink.record(&AuditRecord::new("b", failed(1))).unwrap();
        sink.record(&AuditRecord::new("a", failed(2))).unwrap();
        sink.record(&AuditRecord::new("a", failed(1))).unwrap();

        assert_eq!(sink.len(), 3);
        let a: Vec<u32> = sink.records_for("a").iter().map(|r| r.attempt_index).collect();
        assert_eq!(a, vec![1, 2]);
    }

    #[test]
    fn test_jsonl_sink_appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");

        JsonlAuditSink::new(&path)
            .record(&AuditRecord::new("u1", failed(1)))
            .unwrap();
        let sink = JsonlAuditSink::new(&path);
        sink.record(&AuditRecord::new("u1", failed(2))).unwrap();

        let records = sink.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].attempt_index, 2);
        assert_eq!(
            records[0].attempt.error_kind(),
            Some(AttemptErrorKind::Timeout)
        );
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_read_all_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("absent.jsonl"));
        assert!(sink.read_all().unwrap().is_empty());
    }
}
