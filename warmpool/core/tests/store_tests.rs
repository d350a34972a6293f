//! State store and audit query tests
//!
//! Pagination is checked against both store implementations; durability only
//! against the file store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use warmpool_core::{
    AuditLogEntry, AuditLogger, CasOutcome, FileStateStore, LogFilter, MemoryStateStore, Outcome,
    PoolRecord, StateStore, Tier, UsageEvent,
};

fn seeded(store: Arc<dyn StateStore>) -> AuditLogger {
    let audit = AuditLogger::new(store, "salt");
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    for i in 0..37_i64 {
        let action = if i % 3 == 0 { "configure_pool" } else { "view_logs" };
        // every fifth row shares a timestamp with its predecessor
        let ts = base + Duration::seconds(i - i / 5);
        audit
            .append(
                AuditLogEntry::new(action, Outcome::Success)
                    .with_route("GET /logs")
                    .with_details(serde_json::json!({ "n": i }))
                    .at(ts),
            )
            .unwrap();
    }
    audit
}

fn collect_pages(audit: &AuditLogger, filter: LogFilter) -> (Vec<AuditLogEntry>, usize) {
    let mut rows = Vec::new();
    let mut page = audit.query(&filter).unwrap();
    let total = page.total;
    let mut next = filter;
    loop {
        let done = page.rows.is_empty();
        rows.extend(page.rows);
        if done || rows.len() >= total {
            break;
        }
        next = next.next_page(page.as_of);
        page = audit.query(&next).unwrap();
    }
    (rows, total)
}

fn assert_pages_reproduce_full_fetch(audit: &AuditLogger, action: Option<&str>) {
    let full = audit
        .query(&LogFilter {
            action: action.map(str::to_string),
            limit: Some(500),
            ..Default::default()
        })
        .unwrap();

    let (paged, total) = collect_pages(
        audit,
        LogFilter {
            action: action.map(str::to_string),
            limit: Some(4),
            ..Default::default()
        },
    );

    assert_eq!(total, full.total);
    assert_eq!(paged, full.rows);
    assert!(paged.windows(2).all(|w| w[0].ts >= w[1].ts));

    let unique: HashSet<String> = paged.iter().map(|e| e.details.to_string()).collect();
    assert_eq!(unique.len(), paged.len());
}

#[test]
fn test_pagination_is_complete_in_memory() {
    let audit = seeded(Arc::new(MemoryStateStore::new()));
    assert_pages_reproduce_full_fetch(&audit, None);
    assert_pages_reproduce_full_fetch(&audit, Some("configure_pool"));
}

#[test]
fn test_pagination_is_complete_on_disk() {
    let dir = TempDir::new().unwrap();
    let audit = seeded(Arc::new(FileStateStore::open(dir.path()).unwrap()));
    assert_pages_reproduce_full_fetch(&audit, None);
    assert_pages_reproduce_full_fetch(&audit, Some("view_logs"));
}

#[test]
fn test_pinned_pages_ignore_later_appends() {
    let audit = seeded(Arc::new(MemoryStateStore::new()));
    let first = audit
        .query(&LogFilter {
            limit: Some(10),
            ..Default::default()
        })
        .unwrap();

    // a newer row lands between page fetches
    audit
        .append(AuditLogEntry::new("terminate_pool", Outcome::Success).at(Utc::now()))
        .unwrap();

    let filter = LogFilter {
        limit: Some(10),
        ..Default::default()
    };
    let second = audit.query(&filter.next_page(first.as_of)).unwrap();
    assert_eq!(second.total, first.total);
    assert!(second.rows.iter().all(|row| row.action != "terminate_pool"));

    let unpinned = audit.query(&filter).unwrap();
    assert_eq!(unpinned.total, first.total + 1);
    assert_eq!(unpinned.rows[0].action, "terminate_pool");
}

#[test]
fn test_since_and_limit() {
    let audit = seeded(Arc::new(MemoryStateStore::new()));
    let since = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 20).unwrap();
    let page = audit
        .query(&LogFilter {
            since: Some(since),
            limit: Some(3),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(page.rows.len(), 3);
    assert!(page.rows.iter().all(|row| row.ts >= since));
    assert!(page.total > 3);
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();

    {
        let store = FileStateStore::open(dir.path()).unwrap();
        let current = store.load_pool().unwrap();
        let mut record = current.record.clone();
        record.desired_size = 1;
        record.safe_mode = true;
        assert_eq!(
            store.compare_and_swap(current.version, record).unwrap(),
            CasOutcome::Swapped(current.version + 1)
        );
        store
            .append_audit(AuditLogEntry::new("configure_pool", Outcome::Success).at(now))
            .unwrap();
        store
            .append_usage(UsageEvent {
                ts: now,
                request_id: "req-1".into(),
                tier: Tier::Medium,
                nsfw: false,
                duration_ms: 1_200,
                outcome: Outcome::Success,
            })
            .unwrap();
    }

    let reopened = FileStateStore::open(dir.path()).unwrap();
    let stored = reopened.load_pool().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.record.desired_size, 1);
    assert!(stored.record.safe_mode);

    let audit = reopened.query_audit(&LogFilter::default()).unwrap();
    assert_eq!(audit.total, 1);
    assert_eq!(audit.rows[0].action, "configure_pool");

    let usage = reopened.query_usage(&LogFilter::default()).unwrap();
    assert_eq!(usage.rows[0].request_id, "req-1");

    // sequence numbers continue after replay
    let seq = reopened
        .append_audit(AuditLogEntry::new("view_logs", Outcome::Success))
        .unwrap();
    assert_eq!(seq, 2);
}

#[test]
fn test_file_store_rejects_stale_version() {
    let dir = TempDir::new().unwrap();
    let store = FileStateStore::open(dir.path()).unwrap();
    let current = store.load_pool().unwrap();

    let mut first = current.record.clone();
    first.desired_size = 1;
    store.compare_and_swap(current.version, first).unwrap();

    let stale = PoolRecord::empty(Utc::now());
    match store.compare_and_swap(current.version, stale).unwrap() {
        CasOutcome::Conflict(latest) => {
            assert_eq!(latest.version, current.version + 1);
            assert_eq!(latest.record.desired_size, 1);
        }
        CasOutcome::Swapped(_) => panic!("stale write must not land"),
    }
}
