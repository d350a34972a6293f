//! Pool and instance records
//!
//! The pool record is the single piece of shared mutable state in the control
//! plane. Its logical phase is derived, never stored:
//!
//! ```text
//!            acquire / configure(1)          ready
//!   Empty ─────────────────────────▶ Prewarming ──────▶ Warm ◀─┐ activity
//!     ▲                                   │              │  └──┘
//!     │          provisioning failed      │              │ idle / terminate
//!     ├───────────────────────────────────┘              ▼
//!     └────────────────────────────────────────────── Draining
//!                     destroy ok
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a provisioned instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Created by the provider, not yet serving
    Provisioning,
    /// Serving, with recent activity
    Running,
    /// Serving, no activity within the activity window
    Idle,
    /// Destroy in progress (or pending retry)
    Terminating,
    /// Destroyed; the record is about to be cleared
    Terminated,
}

impl InstanceStatus {
    /// Running or idle
    #[must_use]
    pub fn is_warm(self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }

    /// Anything except terminated still costs money
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// A rented compute instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    /// Provider-assigned contract id
    pub contract_id: String,
    /// Endpoint requests are routed to
    pub connection_url: String,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// When the provider created it
    pub created_at: DateTime<Utc>,
    /// Last acquire or activity report
    pub last_activity_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Instance freshly returned by a provider
    pub fn provisioning(
        contract_id: impl Into<String>,
        connection_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            connection_url: connection_url.into(),
            status: InstanceStatus::Provisioning,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Time since the last activity
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_activity_at)
    }
}

/// Derived phase of the pool state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolPhase {
    /// No instance, nothing in flight
    Empty,
    /// A provisioning attempt is in flight
    Prewarming,
    /// An instance is serving
    Warm,
    /// An instance is being destroyed
    Draining,
}

/// The singleton pool record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    /// Desired pool size (0 or 1)
    pub desired_size: u8,
    /// Suppresses automatic idle eviction
    pub safe_mode: bool,
    /// The instance, if one exists
    pub instance: Option<InstanceRecord>,
    /// True only while a provisioning attempt is in flight
    pub is_prewarming: bool,
    /// Incremented for every provisioning attempt
    #[serde(default)]
    pub provision_attempt: u64,
    /// Last provisioning or destroy failure
    #[serde(default)]
    pub last_error: Option<String>,
    /// Terminate was requested while no instance existed yet
    #[serde(default)]
    pub terminate_requested: bool,
    /// Time of the last committed write
    pub updated_at: DateTime<Utc>,
}

impl PoolRecord {
    /// An empty pool
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            desired_size: 0,
            safe_mode: false,
            instance: None,
            is_prewarming: false,
            provision_attempt: 0,
            last_error: None,
            terminate_requested: false,
            updated_at: now,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> PoolPhase {
        match self.instance.as_ref().map(|i| i.status) {
            Some(InstanceStatus::Running | InstanceStatus::Idle) => PoolPhase::Warm,
            Some(InstanceStatus::Terminating) => PoolPhase::Draining,
            Some(InstanceStatus::Provisioning) => PoolPhase::Prewarming,
            Some(InstanceStatus::Terminated) | None if self.is_prewarming => PoolPhase::Prewarming,
            Some(InstanceStatus::Terminated) | None => PoolPhase::Empty,
        }
    }

    /// The instance if it is warm
    #[must_use]
    pub fn warm_instance(&self) -> Option<&InstanceRecord> {
        self.instance.as_ref().filter(|i| i.status.is_warm())
    }

    /// Number of instances not yet terminated (0 or 1)
    #[must_use]
    pub fn live_instances(&self) -> usize {
        usize::from(self.instance.as_ref().is_some_and(|i| i.status.is_live()))
    }

    /// Back to Empty, keeping operator settings and diagnostics
    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.instance = None;
        self.is_prewarming = false;
        self.terminate_requested = false;
        self.updated_at = now;
    }
}
