//! In-memory state store

use chrono::Utc;
use parking_lot::Mutex;

use super::{CasOutcome, LogTable, StateStore, StoredPool};
use crate::audit::{AuditLogEntry, LogFilter, Page, UsageEvent};
use crate::error::StoreError;
use crate::pool::PoolRecord;

#[derive(Debug)]
struct Inner {
    pool: StoredPool,
    audit: LogTable<AuditLogEntry>,
    usage: LogTable<UsageEvent>,
}

/// Process-local store; state is lost on exit
#[derive(Debug)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Empty pool, empty logs
    #[must_use]
    pub fn new() -> Self {
        Self::with_record(PoolRecord::empty(Utc::now()))
    }

    /// Start from an existing record (version 0)
    #[must_use]
    pub fn with_record(record: PoolRecord) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pool: StoredPool { version: 0, record },
                audit: LogTable::default(),
                usage: LogTable::default(),
            }),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
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
        inner.pool.version += 1;
        inner.pool.record = record;
        Ok(CasOutcome::Swapped(inner.pool.version))
    }

    fn append_audit(&self, entry: AuditLogEntry) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.audit.reserve(entry);
        let seq = row.seq;
        inner.audit.push(row);
        Ok(seq)
    }

    fn query_audit(&self, filter: &LogFilter) -> Result<Page<AuditLogEntry>, StoreError> {
        Ok(self.inner.lock().audit.query(filter))
    }

    fn append_usage(&self, event: UsageEvent) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.usage.reserve(event);
        let seq = row.seq;
        inner.usage.push(row);
        Ok(seq)
    }

    fn query_usage(&self, filter: &LogFilter) -> Result<Page<UsageEvent>, StoreError> {
        Ok(self.inner.lock().usage.query(filter))
    }
}
