//! Injected key-value storage.
//!
//! The core persists only small opaque strings (peer identities, the
//! webhook auth token). The trait is synchronous — every implementation
//! the core ships completes in microseconds — and callers on the link
//! task treat it as cheap.

pub mod sqlite_store;

use std::collections::HashMap;
use std::sync::Mutex;

pub use sqlite_store::SqliteStore;

/// Errors from a storage backend.
#[derive(Debug)]
pub enum StorageError {
    Backend(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Backend(s) => write!(f, "storage backend error: {}", s),
        }
    }
}

impl std::error::Error for StorageError {}

/// Small key-value namespace. Writes are atomic; reads are cheap.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory store (tests, ephemeral hosts)
// ---------------------------------------------------------------------------

/// HashMap-backed store; contents die with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl MemoryStore {
    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.map
            .lock()
            .map_err(|_| StorageError::Backend("store mutex poisoned".to_owned()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.locked()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.locked()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.locked()?.remove(key);
        Ok(())
    }
}
