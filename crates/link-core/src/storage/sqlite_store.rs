//! Durable SQLite key-value store.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.
//! `PRAGMA integrity_check` runs at open; returns an error if it fails.
//!
//! The schema is a single `kv` table. `put` is an UPSERT inside SQLite's
//! own transaction, which gives the atomic-write guarantee the registry
//! relies on.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};

use super::{KvStore, StorageError};

/// SQLite-backed [`KvStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<SqliteStore, StorageError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )
        .map_err(sql_err)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("connection mutex poisoned".to_owned()))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.locked()?;
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .map_err(sql_err)?;
        let mut rows = stmt.query(params![key]).map_err(sql_err)?;
        match rows.next().map_err(sql_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(sql_err)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.locked()?
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.locked()?
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(sql_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )
    .map_err(sql_err)
}

fn run_integrity_check(conn: &Connection) -> Result<(), StorageError> {
    let result: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .map_err(sql_err)?;
    if result != "ok" {
        return Err(StorageError::Backend(format!(
            "integrity check failed: {result}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
