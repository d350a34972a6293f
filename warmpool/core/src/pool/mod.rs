//! Warm pool lifecycle
//!
//! - [`record`]: the persisted pool and instance records
//! - [`controller`]: the state machine and its single-flight provisioning
//! - [`reaper`]: background idle eviction

pub mod controller;
pub mod reaper;
pub mod record;

pub use controller::{PoolController, TerminateOutcome};
pub use reaper::{IdleReaper, ReapOutcome};
pub use record::{InstanceRecord, InstanceStatus, PoolPhase, PoolRecord};
