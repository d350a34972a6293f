//! Audit and usage log
//!
//! [`AuditLogger`] is the only writer of the audit and usage tables. Rows are
//! append-only; queries are ordered newest first (`ts` desc, then insertion
//! sequence desc) and can be pinned to a snapshot with `as_of` so pages stay
//! stable while new rows arrive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::admission::Tier;
use crate::error::Result;
use crate::store::StateStore;

/// Default page size
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Largest page a single query may return
pub const MAX_PAGE_LIMIT: usize = 500;

/// Result of an audited action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Completed as requested
    Success,
    /// Refused (credential, admission)
    Denied,
    /// Attempted and failed
    Error,
}

impl Outcome {
    /// Lowercase label used in filters
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

/// One audit row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// When it happened
    pub ts: DateTime<Utc>,
    /// Fingerprint of the admin credential, never the credential itself
    pub actor: Option<String>,
    /// What was attempted (`configure_pool`, `provision`, ...)
    pub action: String,
    /// Route or internal component
    pub route: String,
    /// Caller address, when known
    pub ip: Option<String>,
    /// Result
    pub outcome: Outcome,
    /// Opaque structured payload
    pub details: serde_json::Value,
}

impl AuditLogEntry {
    /// New entry stamped with the current time
    pub fn new(action: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            ts: Utc::now(),
            actor: None,
            action: action.into(),
            route: String::new(),
            ip: None,
            outcome,
            details: serde_json::Value::Null,
        }
    }

    /// Set the route
    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    /// Set the actor fingerprint
    #[must_use]
    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    /// Set the caller address
    #[must_use]
    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    /// Attach details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Override the timestamp
    #[must_use]
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }
}

/// One usage row, written once per completed or failed request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    /// When the request finished
    pub ts: DateTime<Utc>,
    /// Caller-supplied request id
    pub request_id: String,
    /// Resource tier the request was classified into
    pub tier: Tier,
    /// Whether the request used NSFW models
    pub nsfw: bool,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Result
    pub outcome: Outcome,
}

/// Filter shared by audit and usage queries
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogFilter {
    /// Only rows at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only rows with this action (usage rows: this outcome)
    pub action: Option<String>,
    /// Page size (defaults to 50, capped at 500)
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: usize,
    /// Snapshot sequence returned by an earlier page
    pub as_of: Option<u64>,
}

impl LogFilter {
    /// Page size after defaulting and capping
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    /// Same filter, next page, pinned to `as_of`
    #[must_use]
    pub fn next_page(&self, as_of: u64) -> Self {
        Self {
            offset: self.offset + self.effective_limit(),
            as_of: Some(as_of),
            ..self.clone()
        }
    }
}

/// A page of rows
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Rows on this page, newest first
    pub rows: Vec<T>,
    /// Rows matching the filter across all pages
    pub total: usize,
    /// Newest sequence visible to this query
    pub as_of: u64,
}

/// Hex HMAC-SHA256 of `key`, keyed by `salt`
#[must_use]
pub fn fingerprint(salt: &str, key: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(salt.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => unreachable!(),
    };
    mac.update(key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Writer and reader of the audit and usage tables
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn StateStore>,
    salt: String,
}

impl AuditLogger {
    /// Create a logger over a store
    pub fn new(store: Arc<dyn StateStore>, salt: impl Into<String>) -> Self {
        Self {
            store,
            salt: salt.into(),
        }
    }

    /// Fingerprint a presented credential
    #[must_use]
    pub fn fingerprint(&self, key: &str) -> String {
        fingerprint(&self.salt, key)
    }

    /// Append an audit row
    pub fn append(&self, entry: AuditLogEntry) -> Result<()> {
        tracing::debug!(
            action = %entry.action,
            outcome = entry.outcome.as_str(),
            route = %entry.route,
            "audit"
        );
        self.store.append_audit(entry)?;
        Ok(())
    }

    /// Page through audit rows
    pub fn query(&self, filter: &LogFilter) -> Result<Page<AuditLogEntry>> {
        Ok(self.store.query_audit(filter)?)
    }

    /// Append a usage row
    pub fn record_usage(&self, event: UsageEvent) -> Result<()> {
        tracing::info!(
            request_id = %event.request_id,
            tier = %event.tier,
            duration_ms = event.duration_ms,
            outcome = event.outcome.as_str(),
            "usage"
        );
        self.store.append_usage(event)?;
        Ok(())
    }

    /// Page through usage rows
    pub fn query_usage(&self, filter: &LogFilter) -> Result<Page<UsageEvent>> {
        Ok(self.store.query_usage(filter)?)
    }
}
