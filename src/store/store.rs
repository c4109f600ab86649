//! The Store: JSONL logs fronted by the SQLite index.
//!
//! The logs are the source of truth; the index answers `get`/`query`. On
//! open the index is verified against each log's byte length: behind means
//! replay the tail, ahead or unreadable means delete and rebuild.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{info, warn};

use super::collections::{Collection, Record};
use super::filter::Filter;
use super::index::SqliteIndex;
use super::log::{CollectionLog, LogEntry};
use crate::error::{GyreError, Result};

/// Index database file name.
const INDEX_FILE: &str = "index.db";

/// Durable record store for one project.
pub struct Store {
    logs: HashMap<Collection, CollectionLog>,
    index: Mutex<SqliteIndex>,
    /// Per-collection write serialization
    write_locks: HashMap<Collection, Mutex<()>>,
}

impl Store {
    /// Open the store under `dir`, verifying or rebuilding the index.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        match Self::try_open(dir) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(error = %e, "index unusable, rebuilding from logs");
                let index_path = dir.join(INDEX_FILE);
                if index_path.exists() {
                    std::fs::remove_file(&index_path)?;
                }
                Self::try_open(dir)
            }
        }
    }

    fn try_open(dir: &Path) -> Result<Self> {
        let index = SqliteIndex::open(&dir.join(INDEX_FILE))?;
        let mut logs = HashMap::new();
        let mut write_locks = HashMap::new();
        for collection in Collection::ALL {
            logs.insert(collection, CollectionLog::new(Self::log_path(dir, collection)));
            write_locks.insert(collection, Mutex::new(()));
        }

        let store = Self {
            logs,
            index: Mutex::new(index),
            write_locks,
        };
        store.sync_index()?;
        Ok(store)
    }

    fn log_path(dir: &Path, collection: Collection) -> PathBuf {
        dir.join(format!("{}.log", collection.name()))
    }

    /// Bring the index up to date with every log.
    ///
    /// An index ahead of its log means the log was truncated or swapped out
    /// from under it; that invalidates everything, so rebuild from scratch.
    fn sync_index(&self) -> Result<()> {
        let index = self.index.lock().map_err(|e| GyreError::Store(e.to_string()))?;

        let mut rebuild = false;
        for collection in Collection::ALL {
            let log_len = self.logs[&collection].len()?;
            if index.applied_offset(collection)? > log_len {
                rebuild = true;
                break;
            }
        }

        if rebuild {
            info!("index ahead of logs, rebuilding");
            index.clear()?;
        }

        for collection in Collection::ALL {
            let log = &self.logs[&collection];
            let applied = index.applied_offset(collection)?;
            let entries = log.replay_from(applied)?;
            for entry in entries {
                match entry {
                    LogEntry::Put(value) => index.apply_put(collection, &value)?,
                    LogEntry::Delete(id) => index.apply_delete(collection, &id)?,
                }
            }
            index.set_applied_offset(collection, log.len()?)?;
        }
        Ok(())
    }

    fn with_index<R>(&self, f: impl FnOnce(&SqliteIndex) -> Result<R>) -> Result<R> {
        let index = self.index.lock().map_err(|e| GyreError::Store(e.to_string()))?;
        f(&index)
    }

    fn write_lock(&self, collection: Collection) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_locks[&collection]
            .lock()
            .map_err(|e| GyreError::Store(e.to_string()))
    }

    /// Append a mutation and mirror it into the index. Caller holds the
    /// collection's write lock.
    fn commit(&self, collection: Collection, entry: LogEntry) -> Result<()> {
        let log = &self.logs[&collection];
        let new_len = match &entry {
            LogEntry::Put(value) => log.append(value)?,
            LogEntry::Delete(id) => log.append_tombstone(id)?,
        };
        self.with_index(|index| {
            match &entry {
                LogEntry::Put(value) => index.apply_put(collection, value)?,
                LogEntry::Delete(id) => index.apply_delete(collection, id)?,
            }
            index.set_applied_offset(collection, new_len)
        })
    }

    /// Create a record. Fails with `AlreadyExists` when the id is taken.
    pub fn create<T: Record>(&self, record: &T) -> Result<()> {
        let id = record.record_id().to_string();
        let _write = self.write_lock(T::COLLECTION)?;
        let exists = self.with_index(|index| index.contains(T::COLLECTION, &id))?;
        if exists {
            return Err(GyreError::AlreadyExists(id));
        }
        let value = serde_json::to_value(record)?;
        self.commit(T::COLLECTION, LogEntry::Put(value))
    }

    /// Fetch one record.
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let value = self.with_index(|index| index.get(T::COLLECTION, id))?;
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Replace a record. Fails with `NotFound` when absent; keeps
    /// `updated_at` monotonically increasing per id.
    pub fn update<T: Record>(&self, record: &T) -> Result<()> {
        let id = record.record_id().to_string();
        let _write = self.write_lock(T::COLLECTION)?;
        let previous = self.with_index(|index| index.get(T::COLLECTION, &id))?;
        let previous = previous.ok_or_else(|| GyreError::NotFound(id.clone()))?;

        let mut value = serde_json::to_value(record)?;
        if let (Some(old), Some(new)) = (
            previous.get("updated_at").and_then(Value::as_i64),
            value.get("updated_at").and_then(Value::as_i64),
        ) {
            if new <= old {
                value["updated_at"] = Value::from(old + 1);
            }
        }
        self.commit(T::COLLECTION, LogEntry::Put(value))
    }

    /// Delete a record. Fails with `NotFound` when absent.
    pub fn delete<T: Record>(&self, id: &str) -> Result<()> {
        let _write = self.write_lock(T::COLLECTION)?;
        let exists = self.with_index(|index| index.contains(T::COLLECTION, id))?;
        if !exists {
            return Err(GyreError::NotFound(id.to_string()));
        }
        self.commit(T::COLLECTION, LogEntry::Delete(id.to_string()))
    }

    /// Query by conjunction of filters over declared indexed fields,
    /// ordered by creation time.
    pub fn query<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        let values = self.with_index(|index| index.query(T::COLLECTION, filters))?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(GyreError::from))
            .collect()
    }

    /// All records in a collection.
    pub fn list<T: Record>(&self) -> Result<Vec<T>> {
        self.query(&[])
    }
}
