//! Durable store contract (spec §4.6): a small interface the reconciler
//! uses to persist last-known state and (on startup) recover it for
//! takeover. Not consulted on the hot Start/Stop path.
//!
//! Two implementations ship: [`InMemoryStore`] (default, used in tests)
//! and [`FileStore`] (a single JSON file, modeled on
//! `systemg::cron::CronStateFile`/`PidFile`'s load/mutate/save pattern).
//! Real `sqlite://`/`postgres://`-backed stores are explicitly out of
//! scope (spec §1: "the persistence backend implementation (only the
//! contract is specified)") — seeing those DSN forms returns
//! [`StoreError::UnsupportedBackend`] rather than pulling in a SQL driver
//! this crate has no other use for.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a [`Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure reading or writing the backing file.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file's JSON contents did not parse.
    #[error("store contents malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Queried name has no stored record.
    #[error("no stored record for '{0}'")]
    NotFound(String),
    /// DSN named a backend this crate does not implement (spec §1).
    #[error("unsupported store backend in DSN '{0}'")]
    UnsupportedBackend(String),
}

/// Durable snapshot of one instance's last-observed state (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Instance name, unique within the store.
    pub name: String,
    /// Last-known PID, `0` if not running.
    pub pid: i32,
    /// Last-observed lifecycle state, serialized as its `Display` string.
    pub last_status: String,
    /// Time of the most recent upsert.
    pub updated_at: SystemTime,
}

/// Durable record of last-known state per instance name.
pub trait Store: Send + Sync {
    /// Insert-or-update by `name`.
    fn upsert(&self, record: &StoreRecord) -> Result<(), StoreError>;
    /// Returns the record, or `Ok(None)` if absent.
    fn get(&self, name: &str) -> Result<Option<StoreRecord>, StoreError>;
    /// Removes a record. A no-op if it did not exist.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    /// Enumerates every stored record.
    fn list(&self) -> Result<Vec<StoreRecord>, StoreError>;
    /// Liveness check for the backing medium.
    fn ping(&self) -> Result<(), StoreError>;
}

/// In-process store backed by a `HashMap`. The default when no DSN is
/// configured, and what integration tests use.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, StoreRecord>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        InMemoryStore::default()
    }
}

impl Store for InMemoryStore {
    fn upsert(&self, record: &StoreRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<StoreRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoreRecord>, StoreError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct FileStoreContents {
    records: HashMap<String, StoreRecord>,
}

/// Single-JSON-file store. Every mutation takes an exclusive `fs2` lock on
/// the file for the duration of the read-modify-write cycle, matching
/// `systemg::cron::CronStateFile`'s load/mutate/save discipline.
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    /// Opens (creating if absent) a JSON-backed store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&path)?;
            let empty = FileStoreContents::default();
            file.write_all(serde_json::to_string_pretty(&empty)?.as_bytes())?;
        }
        Ok(FileStore {
            path,
            guard: Mutex::new(()),
        })
    }

    fn with_locked_contents<T>(
        &self,
        f: impl FnOnce(&mut FileStoreContents) -> T,
    ) -> Result<T, StoreError> {
        let _local_guard = self.guard.lock().unwrap();
        let mut file = File::options().read(true).write(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| {
            let contents: FileStoreContents = match serde_json::from_reader(&file) {
                Ok(c) => c,
                Err(err) if err.is_eof() => FileStoreContents::default(),
                Err(err) => return Err(StoreError::Malformed(err)),
            };
            let mut contents = contents;
            let value = f(&mut contents);
            use std::io::{Seek, SeekFrom};
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            serde_json::to_writer_pretty(&file, &contents)?;
            Ok(value)
        })();
        let _ = file.unlock();
        result
    }
}

impl Store for FileStore {
    fn upsert(&self, record: &StoreRecord) -> Result<(), StoreError> {
        self.with_locked_contents(|contents| {
            contents.records.insert(record.name.clone(), record.clone());
        })
    }

    fn get(&self, name: &str) -> Result<Option<StoreRecord>, StoreError> {
        self.with_locked_contents(|contents| contents.records.get(name).cloned())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.with_locked_contents(|contents| {
            contents.records.remove(name);
        })
    }

    fn list(&self) -> Result<Vec<StoreRecord>, StoreError> {
        self.with_locked_contents(|contents| contents.records.values().cloned().collect())
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.with_locked_contents(|_| ())
    }
}

/// Parses a store DSN per spec §6: `sqlite://<path>|:memory:` and
/// `postgres://...` are recognized forms; SQL-backed ones are an explicit
/// scope boundary (`UnsupportedBackend`), `:memory:`/unset routes to
/// [`InMemoryStore`], and any `file://`/bare path routes to [`FileStore`].
pub fn open_from_dsn(dsn: Option<&str>) -> Result<Box<dyn Store>, StoreError> {
    match dsn {
        None | Some(":memory:") | Some("") => Ok(Box::new(InMemoryStore::new())),
        Some(dsn) if dsn.starts_with("postgres://") => {
            Err(StoreError::UnsupportedBackend(dsn.to_string()))
        }
        Some(dsn) if dsn.starts_with("sqlite://") => {
            let path = &dsn["sqlite://".len()..];
            if path == ":memory:" {
                Ok(Box::new(InMemoryStore::new()))
            } else {
                Err(StoreError::UnsupportedBackend(dsn.to_string()))
            }
        }
        Some(dsn) if dsn.starts_with("file://") => {
            Ok(Box::new(FileStore::open(&dsn["file://".len()..])?))
        }
        Some(path) => Ok(Box::new(FileStore::open(Path::new(path))?)),
    }
}
