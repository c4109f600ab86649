//! Append-only JSONL record logs.
//!
//! Every mutation appends a full record line; replaying a log in order with
//! last-write-wins per id reconstructs the collection. Deletes append a
//! tombstone line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{GyreError, Result};

/// Tombstone marker field.
const TOMBSTONE: &str = "_tombstone";

/// One replayed log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// Full record state
    Put(Value),
    /// Record deleted
    Delete(String),
}

impl LogEntry {
    pub fn id(&self) -> Option<&str> {
        match self {
            LogEntry::Put(value) => value.get("id").and_then(Value::as_str),
            LogEntry::Delete(id) => Some(id),
        }
    }
}

/// Append-only log for one collection.
#[derive(Debug)]
pub struct CollectionLog {
    path: PathBuf,
}

impl CollectionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current byte length; zero when the file does not exist yet.
    pub fn len(&self) -> Result<u64> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a full record line and sync. Returns the new byte length.
    pub fn append(&self, record: &Value) -> Result<u64> {
        self.append_line(&serde_json::to_string(record)?)
    }

    /// Append a tombstone line for `id`. Returns the new byte length.
    pub fn append_tombstone(&self, id: &str) -> Result<u64> {
        let line = serde_json::to_string(&serde_json::json!({ "id": id, TOMBSTONE: true }))?;
        self.append_line(&line)
    }

    fn append_line(&self, line: &str) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(file.metadata()?.len())
    }

    /// Replay entries starting at a byte offset, in append order.
    ///
    /// A trailing partial line (torn final write) is skipped rather than
    /// treated as corruption; everything before it is committed state.
    pub fn replay_from(&self, offset: u64) -> Result<Vec<LogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        if offset > 0 {
            use std::io::Seek;
            reader.seek(std::io::SeekFrom::Start(offset))?;
        }

        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            if !line.ends_with('\n') {
                break; // torn tail
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| GyreError::Store(format!("corrupt log line in {}: {}", self.path.display(), e)))?;
            if value.get(TOMBSTONE).and_then(Value::as_bool).unwrap_or(false) {
                let id = value
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GyreError::Store("tombstone without id".to_string()))?;
                entries.push(LogEntry::Delete(id.to_string()));
            } else {
                entries.push(LogEntry::Put(value));
            }
        }
        Ok(entries)
    }

    /// Replay the whole log.
    pub fn replay(&self) -> Result<Vec<LogEntry>> {
        self.replay_from(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir) -> CollectionLog {
        CollectionLog::new(dir.path().join("loops.log"))
    }

    #[test]
    fn test_empty_log_replays_nothing() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        assert_eq!(log.len().unwrap(), 0);
        assert!(log.replay().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_replay_order() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        log.append(&json!({"id": "a", "v": 1})).unwrap();
        log.append(&json!({"id": "b", "v": 1})).unwrap();
        log.append(&json!({"id": "a", "v": 2})).unwrap();

        let entries = log.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], LogEntry::Put(json!({"id": "a", "v": 1})));
        assert_eq!(entries[2], LogEntry::Put(json!({"id": "a", "v": 2})));
    }

    #[test]
    fn test_tombstone_replay() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        log.append(&json!({"id": "a"})).unwrap();
        log.append_tombstone("a").unwrap();

        let entries = log.replay().unwrap();
        assert_eq!(entries[1], LogEntry::Delete("a".to_string()));
    }

    #[test]
    fn test_replay_from_offset() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        let first_end = log.append(&json!({"id": "a"})).unwrap();
        log.append(&json!({"id": "b"})).unwrap();

        let tail = log.replay_from(first_end).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id(), Some("b"));
    }

    #[test]
    fn test_torn_tail_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        log.append(&json!({"id": "a"})).unwrap();
        // Simulate a crash mid-append
        {
            let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
            write!(f, "{{\"id\": \"b\"").unwrap();
        }
        let entries = log.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), Some("a"));
    }

    #[test]
    fn test_corrupt_complete_line_is_error() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        {
            let mut f = OpenOptions::new().create(true).append(true).open(log.path()).unwrap();
            writeln!(f, "not json").unwrap();
        }
        assert!(log.replay().is_err());
    }

    #[test]
    fn test_append_returns_growing_offsets() {
        let tmp = TempDir::new().unwrap();
        let log = log_in(&tmp);
        let a = log.append(&json!({"id": "a"})).unwrap();
        let b = log.append(&json!({"id": "b"})).unwrap();
        assert!(b > a);
        assert_eq!(log.len().unwrap(), b);
    }
}
