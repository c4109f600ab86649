//! SQLite secondary index.
//!
//! Holds the latest state per record plus one row per indexed field. The
//! index is disposable: `meta` tracks how far into each log it has applied,
//! and anything suspicious gets thrown away and rebuilt from the logs.

use std::path::Path;

use rusqlite::{Connection, params};
use serde_json::Value;

use super::collections::Collection;
use super::filter::{Filter, FilterOp};
use crate::error::{GyreError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    json TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (collection, id)
);

CREATE TABLE IF NOT EXISTS fields (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    text_value TEXT,
    num_value REAL,
    PRIMARY KEY (collection, id, field)
);

CREATE INDEX IF NOT EXISTS idx_fields_text ON fields(collection, field, text_value);
CREATE INDEX IF NOT EXISTS idx_fields_num ON fields(collection, field, num_value);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Text form used for equality comparisons in the index.
fn canonical_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The rebuildable index over all collections.
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    /// Open (or create) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory index for tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Byte offset of `collection`'s log already applied to this index.
    pub fn applied_offset(&self, collection: Collection) -> Result<u64> {
        let key = format!("offset:{}", collection.name());
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn set_applied_offset(&self, collection: Collection, offset: u64) -> Result<()> {
        let key = format!("offset:{}", collection.name());
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, offset.to_string()],
        )?;
        Ok(())
    }

    /// Upsert one record and its indexed fields.
    pub fn apply_put(&self, collection: Collection, record: &Value) -> Result<()> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GyreError::Store("record without id".to_string()))?;
        let created_at = record.get("created_at").and_then(Value::as_i64).unwrap_or(0);

        self.conn.execute(
            "INSERT INTO records (collection, id, json, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET json = excluded.json, created_at = excluded.created_at",
            params![collection.name(), id, serde_json::to_string(record)?, created_at],
        )?;
        self.conn.execute(
            "DELETE FROM fields WHERE collection = ?1 AND id = ?2",
            params![collection.name(), id],
        )?;
        for field in collection.indexed_fields() {
            let value = record.get(*field).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                continue; // absent and null look the same to the index
            }
            let text = canonical_text(&value);
            let num = value.as_f64();
            self.conn.execute(
                "INSERT INTO fields (collection, id, field, text_value, num_value) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![collection.name(), id, field, text, num],
            )?;
        }
        Ok(())
    }

    /// Remove one record and its indexed fields.
    pub fn apply_delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.name(), id],
        )?;
        self.conn.execute(
            "DELETE FROM fields WHERE collection = ?1 AND id = ?2",
            params![collection.name(), id],
        )?;
        Ok(())
    }

    /// Fetch one record's JSON.
    pub fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT json FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.name(), id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Query by conjunction of filters, ordered by (created_at, id).
    ///
    /// Filters must name declared indexed fields.
    pub fn query(&self, collection: Collection, filters: &[Filter]) -> Result<Vec<Value>> {
        for filter in filters {
            if !collection.indexed_fields().contains(&filter.field.as_str()) {
                return Err(GyreError::Store(format!(
                    "field '{}' is not indexed on {}",
                    filter.field,
                    collection.name()
                )));
            }
        }

        let mut sql = String::from("SELECT json FROM records r WHERE r.collection = ?1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(collection.name().to_string())];
        let mut n = 1;

        for filter in filters {
            let exists_head = format!(
                "EXISTS (SELECT 1 FROM fields f WHERE f.collection = r.collection AND f.id = r.id AND f.field = ?{}",
                n + 1
            );
            match filter.op {
                FilterOp::Eq => {
                    match canonical_text(&filter.value) {
                        Some(text) => {
                            sql.push_str(&format!(" AND {} AND f.text_value = ?{})", exists_head, n + 2));
                            args.push(Box::new(filter.field.clone()));
                            args.push(Box::new(text));
                            n += 2;
                        }
                        None => {
                            // Eq(null) means absent
                            sql.push_str(&format!(" AND NOT {})", exists_head));
                            args.push(Box::new(filter.field.clone()));
                            n += 1;
                        }
                    }
                }
                FilterOp::NotNull => {
                    sql.push_str(&format!(" AND {})", exists_head));
                    args.push(Box::new(filter.field.clone()));
                    n += 1;
                }
                FilterOp::Lt => {
                    let bound = filter.value.as_f64().ok_or_else(|| {
                        GyreError::Store(format!("Lt filter on '{}' needs a numeric bound", filter.field))
                    })?;
                    sql.push_str(&format!(" AND {} AND f.num_value < ?{})", exists_head, n + 2));
                    args.push(Box::new(filter.field.clone()));
                    args.push(Box::new(bound));
                    n += 2;
                }
                FilterOp::Absent => {
                    sql.push_str(&format!(" AND NOT {})", exists_head));
                    args.push(Box::new(filter.field.clone()));
                    n += 1;
                }
            }
        }
        sql.push_str(" ORDER BY r.created_at, r.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    /// Whether a record exists.
    pub fn contains(&self, collection: Collection, id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.name(), id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drop all indexed state (before a rebuild).
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM records", [])?;
        self.conn.execute("DELETE FROM fields", [])?;
        self.conn.execute("DELETE FROM meta", [])?;
        Ok(())
    }
}
