//! File-backed state store
//!
//! ```text
//! <data_dir>/
//! ├── pool.json      { version, record }   rewritten atomically (tmp + fsync + rename)
//! ├── audit.jsonl    { seq, row } per line  append-only
//! └── usage.jsonl    { seq, row } per line  append-only
//! ```
//!
//! Log files are replayed into memory on open so queries never touch disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CasOutcome, LogRow, LogTable, Sequenced, StateStore, StoredPool};
use crate::audit::{AuditLogEntry, LogFilter, Page, UsageEvent};
use crate::error::StoreError;
use crate::pool::PoolRecord;

const POOL_FILE: &str = "pool.json";
const AUDIT_FILE: &str = "audit.jsonl";
const USAGE_FILE: &str = "usage.jsonl";

struct AppendLog<T> {
    table: LogTable<T>,
    file: File,
}

impl<T: LogRow + Serialize + DeserializeOwned> AppendLog<T> {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let mut table = LogTable::default();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: Sequenced<T> = serde_json::from_str(&line)?;
                table.push(entry);
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { table, file })
    }

    fn append(&mut self, row: T) -> Result<u64, StoreError> {
        let entry = self.table.reserve(row);
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        let seq = entry.seq;
        self.table.push(entry);
        Ok(seq)
    }
}

struct Inner {
    pool: StoredPool,
    audit: AppendLog<AuditLogEntry>,
    usage: AppendLog<UsageEvent>,
}

/// Durable store rooted at a directory
pub struct FileStateStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for FileStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileStateStore {
    /// Open (creating if needed) a store in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let pool_path = dir.join(POOL_FILE);
        let pool = if pool_path.exists() {
            let raw = fs::read(&pool_path)?;
            serde_json::from_slice(&raw)?
        } else {
            let fresh = StoredPool {
                version: 0,
                record: PoolRecord::empty(Utc::now()),
            };
            write_atomic(&pool_path, &fresh)?;
            fresh
        };

        let audit = AppendLog::open(&dir.join(AUDIT_FILE))?;
        let usage = AppendLog::open(&dir.join(USAGE_FILE))?;

        tracing::info!(
            dir = %dir.display(),
            version = pool.version,
            audit_rows = audit.table.head(),
            usage_rows = usage.table.head(),
            "Opened state store"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner { pool, audit, usage }),
        })
    }

    /// Directory holding the store files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn write_atomic(path: &Path, value: &StoredPool) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl StateStore for FileStateStore {
    fn load_pool(&self) -> Result<StoredPool, StoreError> {
        Ok(self.inner.lock().pool.clone())
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        record: PoolRecord,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if inner.pool.version != expected_version {
            return Ok(CasOutcome::Conflict(inner.pool.clone()));
        }
        let next = StoredPool {
            version: expected_version + 1,
            record,
        };
        write_atomic(&self.dir.join(POOL_FILE), &next)?;
        let version = next.version;
        inner.pool = next;
        Ok(CasOutcome::Swapped(version))
    }

    fn append_audit(&self, entry: AuditLogEntry) -> Result<u64, StoreError> {
        self.inner.lock().audit.append(entry)
    }

    fn query_audit(&self, filter: &LogFilter) -> Result<Page<AuditLogEntry>, StoreError> {
        Ok(self.inner.lock().audit.table.query(filter))
    }

    fn append_usage(&self, event: UsageEvent) -> Result<u64, StoreError> {
        self.inner.lock().usage.append(event)
    }

    fn query_usage(&self, filter: &LogFilter) -> Result<Page<UsageEvent>, StoreError> {
        Ok(self.inner.lock().usage.table.query(filter))
    }
}
