//! State Store
//!
//! Persistence for the singleton pool record and the append-only log tables.
//! No policy lives here, only the atomicity contract:
//!
//! - [`StateStore::load_pool`] always observes the most recently committed write
//! - [`StateStore::compare_and_swap`] commits only if the version is unchanged
//! - log rows are never mutated or deleted
//!
//! # Implementations
//!
//! | Store                 | Durability              | Use                      |
//! |-----------------------|-------------------------|--------------------------|
//! | [`MemoryStateStore`]  | process lifetime        | tests, `--ephemeral`     |
//! | [`FileStateStore`]    | JSON + JSON-lines files | production               |

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLogEntry, LogFilter, Page, UsageEvent};
use crate::error::StoreError;
use crate::pool::PoolRecord;

/// The pool record together with its commit version
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredPool {
    /// Incremented on every committed swap
    pub version: u64,
    /// The record
    pub record: PoolRecord,
}

/// Result of a compare-and-swap
#[derive(Clone, Debug, PartialEq)]
pub enum CasOutcome {
    /// Committed; carries the new version
    Swapped(u64),
    /// Someone else committed first; carries what they wrote
    Conflict(StoredPool),
}

/// Repository for pool state and log tables
pub trait StateStore: Send + Sync {
    /// Read the current pool record
    fn load_pool(&self) -> Result<StoredPool, StoreError>;

    /// Replace the pool record if its version is still `expected_version`
    fn compare_and_swap(
        &self,
        expected_version: u64,
        record: PoolRecord,
    ) -> Result<CasOutcome, StoreError>;

    /// Append an audit row, returning its sequence number
    fn append_audit(&self, entry: AuditLogEntry) -> Result<u64, StoreError>;

    /// Query audit rows
    fn query_audit(&self, filter: &LogFilter) -> Result<Page<AuditLogEntry>, StoreError>;

    /// Append a usage row, returning its sequence number
    fn append_usage(&self, event: UsageEvent) -> Result<u64, StoreError>;

    /// Query usage rows
    fn query_usage(&self, filter: &LogFilter) -> Result<Page<UsageEvent>, StoreError>;
}

// ============================================================================
// Shared log table logic
// ============================================================================

/// A log row with its insertion sequence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Sequenced<T> {
    pub seq: u64,
    pub row: T,
}

/// Fields the filter looks at
pub(crate) trait LogRow: Clone {
    fn ts(&self) -> DateTime<Utc>;
    fn matches_action(&self, action: &str) -> bool;
}

impl LogRow for AuditLogEntry {
    fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    fn matches_action(&self, action: &str) -> bool {
        self.action == action
    }
}

impl LogRow for UsageEvent {
    fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    fn matches_action(&self, action: &str) -> bool {
        self.outcome.as_str() == action
    }
}

/// Append-only table kept in memory, newest sequence last
#[derive(Debug)]
pub(crate) struct LogTable<T> {
    rows: Vec<Sequenced<T>>,
    next_seq: u64,
}

impl<T> Default for LogTable<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            next_seq: 1,
        }
    }
}

impl<T: LogRow> LogTable<T> {
    /// Assign the next sequence number without storing
    pub fn reserve(&mut self, row: T) -> Sequenced<T> {
        let seq = self.next_seq;
        self.next_seq += 1;
        Sequenced { seq, row }
    }

    /// Store a row that was reserved or replayed
    pub fn push(&mut self, entry: Sequenced<T>) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.rows.push(entry);
    }

    /// Newest sequence stored so far
    pub fn head(&self) -> u64 {
        self.next_seq - 1
    }

    /// Filter, sort, and slice
    pub fn query(&self, filter: &LogFilter) -> Page<T> {
        let as_of = filter.as_of.map_or(self.head(), |pinned| pinned.min(self.head()));

        let mut matching: Vec<&Sequenced<T>> = self
            .rows
            .iter()
            .filter(|e| e.seq <= as_of)
            .filter(|e| filter.since.map_or(true, |since| e.row.ts() >= since))
            .filter(|e| {
                filter
                    .action
                    .as_deref()
                    .map_or(true, |action| e.row.matches_action(action))
            })
            .collect();

        matching.sort_by(|a, b| b.row.ts().cmp(&a.row.ts()).then(b.seq.cmp(&a.seq)));

        let total = matching.len();
        let rows = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .map(|e| e.row.clone())
            .collect();

        Page { rows, total, as_of }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Outcome;
    use chrono::TimeZone;

    fn entry(action: &str, minute: u32) -> AuditLogEntry {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap();
        AuditLogEntry::new(action, Outcome::Success).at(ts)
    }

    #[test]
    fn test_orders_by_ts_then_sequence() {
        let mut table = LogTable::default();
        for (action, minute) in [("a", 5), ("b", 1), ("c", 5), ("d", 9)] {
            let reserved = table.reserve(entry(action, minute));
            table.push(reserved);
        }
        let page = table.query(&LogFilter::default());
        let order: Vec<_> = page.rows.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(order, vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn test_as_of_hides_later_rows() {
        let mut table = LogTable::default();
        for minute in 0..3 {
            let reserved = table.reserve(entry("x", minute));
            table.push(reserved);
        }
        let first = table.query(&LogFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(first.as_of, 3);

        let reserved = table.reserve(entry("x", 30));
        table.push(reserved);

        let second = table.query(&LogFilter {
            limit: Some(2),
            ..Default::default()
        }
        .next_page(first.as_of));
        assert_eq!(second.total, 3);
        assert_eq!(second.rows.len(), 1);
    }

    #[test]
    fn test_since_filter_is_inclusive() {
        let mut table = LogTable::default();
        for minute in [1, 2, 3] {
            let reserved = table.reserve(entry("x", minute));
            table.push(reserved);
        }
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 12, 2, 0).unwrap();
        let page = table.query(&LogFilter {
            since: Some(since),
            ..Default::default()
        });
        assert_eq!(page.total, 2);
    }
}
