//! Idle Reaper
//!
//! Background loop that evicts an unused warm instance. Each tick:
//!
//! 1. `terminating` instance left behind by a failed destroy: retry the destroy
//! 2. `running` past the activity window: demote to `idle`
//! 3. warm, safe mode off, idle past `idle_minutes`: evict
//!
//! Step 3 re-checks every condition inside the controller's CAS, so an
//! `acquire` that refreshed activity a moment earlier wins.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::controller::{PoolController, TerminateOutcome};
use super::record::{InstanceStatus, PoolPhase};
use crate::error::Result;

/// What one tick did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Nothing to do
    Nothing,
    /// Instance is idle but safe mode protects it
    Protected,
    /// `running` demoted to `idle`
    Demoted,
    /// Instance evicted
    Evicted {
        /// Destroyed contract
        contract_id: String,
    },
    /// A destroy was attempted and failed again
    DestroyFailed {
        /// Contract still pending
        contract_id: String,
    },
}

/// Periodic idle eviction
pub struct IdleReaper {
    controller: PoolController,
}

impl IdleReaper {
    /// Reaper driving a controller
    #[must_use]
    pub fn new(controller: PoolController) -> Self {
        Self { controller }
    }

    /// One pass at the current time
    pub async fn tick(&self) -> Result<ReapOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// One pass as if the clock read `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<ReapOutcome> {
        let record = self.controller.status()?;
        let Some(instance) = record.instance.as_ref() else {
            return Ok(ReapOutcome::Nothing);
        };

        match record.phase() {
            PoolPhase::Draining => {
                tracing::info!(contract_id = %instance.contract_id, "Retrying destroy of terminating instance");
                Ok(Self::from_terminate(self.controller.terminate(true).await?))
            }
            PoolPhase::Warm => {
                let idle_for = instance.idle_for(now);
                let threshold = self.controller.config().pool.idle_threshold();
                if idle_for <= threshold {
                    if instance.status == InstanceStatus::Running
                        && self.controller.demote_idle(now)?
                    {
                        tracing::debug!(contract_id = %instance.contract_id, "Instance idle");
                        return Ok(ReapOutcome::Demoted);
                    }
                    return Ok(ReapOutcome::Nothing);
                }
                if record.safe_mode {
                    tracing::debug!(
                        contract_id = %instance.contract_id,
                        idle_minutes = idle_for.num_minutes(),
                        "Idle instance kept alive by safe mode"
                    );
                    return Ok(ReapOutcome::Protected);
                }
                tracing::info!(
                    contract_id = %instance.contract_id,
                    idle_minutes = idle_for.num_minutes(),
                    "Evicting idle instance"
                );
                Ok(Self::from_terminate(self.controller.evict_at(now).await?))
            }
            PoolPhase::Empty | PoolPhase::Prewarming => Ok(ReapOutcome::Nothing),
        }
    }

    fn from_terminate(outcome: TerminateOutcome) -> ReapOutcome {
        match outcome {
            TerminateOutcome::Terminated { contract_id } => ReapOutcome::Evicted { contract_id },
            TerminateOutcome::Pending { contract_id, .. } => ReapOutcome::DestroyFailed { contract_id },
            TerminateOutcome::AlreadyEmpty
            | TerminateOutcome::Deferred
            | TerminateOutcome::Skipped => ReapOutcome::Nothing,
        }
    }

    /// Tick every `reaper_interval` until `shutdown` flips to true. Stops
    /// early on a store failure.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.controller.config().pool.reaper_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = period.as_secs(), "Idle reaper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(ReapOutcome::Nothing) => tracing::trace!("Reaper tick: nothing to do"),
                        Ok(outcome) => tracing::debug!(?outcome, "Reaper tick"),
                        Err(err) if err.is_fatal() => {
                            tracing::error!(error = %err, "Reaper stopping on store failure");
                            break;
                        }
                        Err(err) => tracing::warn!(error = %err, "Reaper tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Idle reaper stopped");
    }
}
