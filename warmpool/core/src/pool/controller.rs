//! Pool Controller
//!
//! Sole writer of the pool record. Every mutation is a compare-and-swap
//! against the store, retried on conflict, so two callers can never both
//! believe they own a provisioning attempt.
//!
//! # Acquire
//!
//! ```text
//! load ─┬─ Warm ───────▶ CAS(last_activity) ─▶ connection url
//!       ├─ Empty ──────▶ CAS(is_prewarming) ─┬─ won  ─▶ spawn provisioning, wait
//!       │                                    └─ lost ─▶ reload
//!       ├─ Prewarming ─▶ join: wait (notify | backoff) until deadline
//!       └─ Draining ───▶ NoGpuAvailable
//! ```
//!
//! Provisioning runs in its own task and is never cancelled by a caller that
//! gives up waiting; other callers may still be joined to it.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::record::{InstanceRecord, InstanceStatus, PoolPhase, PoolRecord};
use crate::admission::{ComplexityClassifier, Tier};
use crate::audit::{AuditLogEntry, AuditLogger, Outcome};
use crate::config::{deadline_after, ControllerConfig};
use crate::error::{ControllerError, ProviderError, Result, StoreError};
use crate::provider::{CloudProvider, InstanceSpec};
use crate::store::{CasOutcome, StateStore, StoredPool};

const ROUTE: &str = "controller";

/// Result of a single CAS attempt body
enum Mutation<T> {
    /// Write the modified record, then return the value
    Commit(T),
    /// Leave the record alone
    Skip(T),
}

/// What `terminate` did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// Nothing to terminate
    AlreadyEmpty,
    /// Provisioning is in flight; the instance is destroyed as soon as it exists
    Deferred,
    /// Destroyed and cleared
    Terminated {
        /// Destroyed contract
        contract_id: String,
    },
    /// Destroy failed; the instance stays `terminating` and the reaper retries
    Pending {
        /// Contract awaiting destroy
        contract_id: String,
        /// Last provider error
        reason: String,
    },
    /// Automatic eviction no longer applies (activity, safe mode)
    Skipped,
}

struct Shared {
    config: Arc<ControllerConfig>,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn CloudProvider>,
    audit: AuditLogger,
    classifier: ComplexityClassifier,
    changed: Notify,
    fatal: watch::Sender<Option<String>>,
}

/// Owner of the warm pool state machine
#[derive(Clone)]
pub struct PoolController {
    shared: Arc<Shared>,
}

impl PoolController {
    /// Create a controller
    pub fn new(
        config: Arc<ControllerConfig>,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn CloudProvider>,
        audit: AuditLogger,
    ) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                provider,
                audit,
                classifier: ComplexityClassifier,
                changed: Notify::new(),
                fatal,
            }),
        }
    }

    /// Shared configuration
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// The audit logger this controller writes to
    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.shared.audit
    }

    /// Receives the reason once the store has failed; the process must restart
    #[must_use]
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.shared.fatal.subscribe()
    }

    /// Trip the fatal channel if `err` came from the store
    pub fn escalate(&self, err: &ControllerError) {
        if let ControllerError::StateStoreIo(source) = err {
            self.shared.fatal.send_replace(Some(source.to_string()));
        }
    }

    // ========================================================================
    // Store access
    // ========================================================================

    fn checked<T>(&self, result: std::result::Result<T, StoreError>) -> Result<T> {
        result.map_err(|err| {
            tracing::error!(error = %err, "State store failed; controller must stop");
            self.shared.fatal.send_replace(Some(err.to_string()));
            ControllerError::StateStoreIo(err)
        })
    }

    fn load(&self) -> Result<StoredPool> {
        self.checked(self.shared.store.load_pool())
    }

    fn mutate<T>(&self, mut apply: impl FnMut(&mut PoolRecord) -> Mutation<T>) -> Result<T> {
        let mut stored = self.load()?;
        loop {
            let mut record = stored.record.clone();
            let value = match apply(&mut record) {
                Mutation::Skip(value) => return Ok(value),
                Mutation::Commit(value) => value,
            };
            record.updated_at = Utc::now();
            match self.checked(self.shared.store.compare_and_swap(stored.version, record))? {
                CasOutcome::Swapped(version) => {
                    tracing::trace!(version, "Pool record committed");
                    self.shared.changed.notify_waiters();
                    return Ok(value);
                }
                CasOutcome::Conflict(current) => {
                    tracing::debug!(
                        expected = stored.version,
                        found = current.version,
                        "Pool record CAS conflict, retrying"
                    );
                    stored = current;
                }
            }
        }
    }

    fn audit_event(&self, action: &str, outcome: Outcome, details: serde_json::Value) -> Result<()> {
        self.shared.audit.append(
            AuditLogEntry::new(action, outcome)
                .with_route(ROUTE)
                .with_details(details),
        )
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Read-only snapshot
    pub fn status(&self) -> Result<PoolRecord> {
        Ok(self.load()?.record)
    }

    /// Apply operator settings. Identical values are a no-op; a rise from 0
    /// with no instance schedules provisioning without waiting for it.
    pub fn configure(&self, desired_size: u32, safe_mode: bool) -> Result<PoolRecord> {
        let desired = if desired_size > 1 {
            tracing::warn!(requested = desired_size, "Pool holds at most one instance; clamping");
            1
        } else {
            desired_size as u8
        };

        let scheduled = self.mutate(|record| {
            if record.desired_size == desired && record.safe_mode == safe_mode {
                return Mutation::Skip(None);
            }
            let rising = record.desired_size == 0 && desired >= 1;
            record.desired_size = desired;
            record.safe_mode = safe_mode;
            if rising && record.phase() == PoolPhase::Empty {
                record.is_prewarming = true;
                record.provision_attempt += 1;
                record.last_error = None;
                record.terminate_requested = false;
                Mutation::Commit(Some(record.provision_attempt))
            } else {
                Mutation::Commit(None)
            }
        })?;

        tracing::info!(desired_size = desired, safe_mode, "Pool configured");
        if let Some(attempt) = scheduled {
            self.spawn_provisioning(attempt, self.shared.config.pool.default_tier, false);
        }
        self.status()
    }

    /// Live endpoint for a request, sized for the default tier
    pub async fn acquire(&self, request_id: &str) -> Result<String> {
        self.acquire_for(request_id, self.shared.config.pool.default_tier, false)
            .await
    }

    /// Live endpoint for a request, sized from its prompt
    pub async fn acquire_for_prompt(&self, request_id: &str, prompt: &str) -> Result<String> {
        let classification = self.shared.classifier.classify(prompt);
        self.acquire_for(request_id, classification.tier, classification.nsfw)
            .await
    }

    /// Live endpoint for a request. Starts provisioning on an empty pool or
    /// joins the attempt already in flight; waits at most `acquire_timeout`.
    pub async fn acquire_for(&self, request_id: &str, tier: Tier, nsfw: bool) -> Result<String> {
        let timeout = self.shared.config.pool.acquire_timeout();
        let deadline = deadline_after(timeout);
        let mut joined: Option<u64> = None;
        let mut round = 0;

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.load()?.record;
            match record.phase() {
                PoolPhase::Warm => {
                    if let Some(url) = self.touch(Utc::now())? {
                        tracing::debug!(request_id, "Acquired warm instance");
                        return Ok(url);
                    }
                    continue;
                }
                PoolPhase::Empty => {
                    if joined.is_some() {
                        return Err(Self::attempt_failed(&record));
                    }
                    let won = self.mutate(|r| {
                        if r.phase() != PoolPhase::Empty {
                            return Mutation::Skip(None);
                        }
                        r.is_prewarming = true;
                        r.provision_attempt += 1;
                        r.last_error = None;
                        r.terminate_requested = false;
                        Mutation::Commit(Some(r.provision_attempt))
                    })?;
                    if let Some(attempt) = won {
                        tracing::info!(request_id, attempt, %tier, nsfw, "Pool empty, provisioning");
                        joined = Some(attempt);
                        self.spawn_provisioning(attempt, tier, nsfw);
                    }
                    continue;
                }
                PoolPhase::Prewarming => match joined {
                    None => {
                        tracing::debug!(
                            request_id,
                            attempt = record.provision_attempt,
                            "Joining in-flight provisioning"
                        );
                        joined = Some(record.provision_attempt);
                    }
                    Some(attempt) if attempt != record.provision_attempt => {
                        return Err(Self::attempt_failed(&record));
                    }
                    Some(_) => {}
                },
                PoolPhase::Draining => {
                    return Err(ControllerError::no_gpu("instance is terminating"));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(request_id, ?timeout, "Gave up waiting for provisioning");
                return Err(ControllerError::no_gpu(format!(
                    "no instance became ready within {}s",
                    timeout.as_secs()
                )));
            }
            let backoff = self
                .shared
                .config
                .retry
                .backoff_for_attempt(round)
                .min(deadline - now);
            round += 1;

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn attempt_failed(record: &PoolRecord) -> ControllerError {
        ControllerError::no_gpu(
            record
                .last_error
                .clone()
                .unwrap_or_else(|| "provisioning failed".to_string()),
        )
    }

    /// Refresh `last_activity_at`. Returns false if nothing is warm.
    pub fn mark_activity(&self, request_id: &str) -> Result<bool> {
        let touched = self.touch(Utc::now())?.is_some();
        if touched {
            tracing::trace!(request_id, "Activity recorded");
        } else {
            tracing::debug!(request_id, "Activity reported with no warm instance");
        }
        Ok(touched)
    }

    fn touch(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        self.mutate(|record| match record.instance.as_mut() {
            Some(instance) if instance.status.is_warm() => {
                instance.last_activity_at = now;
                instance.status = InstanceStatus::Running;
                Mutation::Commit(Some(instance.connection_url.clone()))
            }
            _ => Mutation::Skip(None),
        })
    }

    /// Destroy the instance from any non-Empty phase, regardless of safe mode.
    /// During provisioning the request is recorded and honored once the
    /// in-flight attempt returns. `force` is carried into the audit row.
    pub async fn terminate(&self, force: bool) -> Result<TerminateOutcome> {
        self.terminate_guarded(force, None).await
    }

    /// Idle eviction evaluated at `now`. Only a warm instance with safe mode
    /// off and idle past the threshold is destroyed; every condition is
    /// re-checked inside the CAS so fresh activity wins.
    pub(crate) async fn evict_at(&self, now: DateTime<Utc>) -> Result<TerminateOutcome> {
        self.terminate_guarded(false, Some(now)).await
    }

    async fn terminate_guarded(
        &self,
        force: bool,
        evict_at: Option<DateTime<Utc>>,
    ) -> Result<TerminateOutcome> {
        let idle_threshold = self.shared.config.pool.idle_threshold();

        enum Step {
            Empty,
            Deferred,
            Skipped,
            Destroy(String),
        }

        let step = self.mutate(|record| match (record.phase(), evict_at) {
            (PoolPhase::Empty, _) => Mutation::Skip(Step::Empty),
            (PoolPhase::Prewarming | PoolPhase::Draining, Some(_)) => Mutation::Skip(Step::Skipped),
            (PoolPhase::Prewarming, None) => {
                if record.terminate_requested {
                    Mutation::Skip(Step::Deferred)
                } else {
                    record.terminate_requested = true;
                    Mutation::Commit(Step::Deferred)
                }
            }
            (PoolPhase::Draining, None) => match &record.instance {
                Some(instance) => Mutation::Skip(Step::Destroy(instance.contract_id.clone())),
                None => Mutation::Skip(Step::Empty),
            },
            (PoolPhase::Warm, evict_at) => {
                let safe_mode = record.safe_mode;
                let Some(instance) = record.instance.as_mut() else {
                    return Mutation::Skip(Step::Empty);
                };
                if let Some(now) = evict_at {
                    if safe_mode || instance.idle_for(now) <= idle_threshold {
                        return Mutation::Skip(Step::Skipped);
                    }
                }
                instance.status = InstanceStatus::Terminating;
                Mutation::Commit(Step::Destroy(instance.contract_id.clone()))
            }
        })?;

        match step {
            Step::Empty => Ok(TerminateOutcome::AlreadyEmpty),
            Step::Skipped => Ok(TerminateOutcome::Skipped),
            Step::Deferred => {
                tracing::info!("Terminate requested during provisioning; deferring");
                Ok(TerminateOutcome::Deferred)
            }
            Step::Destroy(contract_id) => {
                tracing::info!(
                    contract_id = %contract_id,
                    force,
                    evict = evict_at.is_some(),
                    "Terminating instance"
                );
                self.destroy_and_clear(&contract_id, force).await
            }
        }
    }

    async fn destroy_and_clear(&self, contract_id: &str, force: bool) -> Result<TerminateOutcome> {
        let provider = &self.shared.provider;
        let destroyed = self
            .with_retry("destroy_instance", move || provider.destroy_instance(contract_id))
            .await;

        match destroyed {
            Ok(()) => {
                self.clear_contract(contract_id, None)?;
                self.audit_event(
                    "terminate",
                    Outcome::Success,
                    serde_json::json!({ "contractId": contract_id, "force": force }),
                )?;
                tracing::info!(contract_id, "Instance terminated");
                Ok(TerminateOutcome::Terminated {
                    contract_id: contract_id.to_string(),
                })
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::error!(contract_id, error = %reason, "Destroy failed; will retry");
                self.mutate(|record| {
                    record.last_error = Some(format!("destroy {contract_id}: {reason}"));
                    Mutation::Commit(())
                })?;
                self.audit_event(
                    "terminate",
                    Outcome::Error,
                    serde_json::json!({ "contractId": contract_id, "force": force, "error": reason }),
                )?;
                Ok(TerminateOutcome::Pending {
                    contract_id: contract_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Remove the instance if it is still `contract_id`
    fn clear_contract(&self, contract_id: &str, last_error: Option<String>) -> Result<()> {
        self.mutate(|record| {
            let matches = record
                .instance
                .as_ref()
                .is_some_and(|i| i.contract_id == contract_id);
            if !matches && record.instance.is_some() {
                return Mutation::Skip(());
            }
            if let Some(instance) = record.instance.as_mut() {
                instance.status = InstanceStatus::Terminated;
            }
            record.clear(Utc::now());
            if last_error.is_some() {
                record.last_error = last_error.clone();
            }
            Mutation::Commit(())
        })
    }

    /// Demote `running` to `idle` once the activity window has passed
    pub(crate) fn demote_idle(&self, now: DateTime<Utc>) -> Result<bool> {
        let window = self.shared.config.pool.activity_window();
        self.mutate(|record| match record.instance.as_mut() {
            Some(instance)
                if instance.status == InstanceStatus::Running && instance.idle_for(now) > window =>
            {
                instance.status = InstanceStatus::Idle;
                Mutation::Commit(true)
            }
            _ => Mutation::Skip(false),
        })
    }

    /// Repair state left by a crash: an interrupted provisioning attempt is
    /// abandoned, and an instance that never became ready is queued for destroy.
    pub fn recover(&self) -> Result<bool> {
        let repaired = self.mutate(|record| {
            let mut changed = false;
            if let Some(instance) = record.instance.as_mut() {
                if instance.status == InstanceStatus::Provisioning {
                    instance.status = InstanceStatus::Terminating;
                    changed = true;
                }
            }
            if record.is_prewarming {
                record.is_prewarming = false;
                record.terminate_requested = false;
                record.last_error = Some("provisioning interrupted by restart".to_string());
                changed = true;
            }
            if changed {
                Mutation::Commit(true)
            } else {
                Mutation::Skip(false)
            }
        })?;

        if repaired {
            let record = self.status()?;
            tracing::warn!(
                attempt = record.provision_attempt,
                "Recovered interrupted provisioning state"
            );
            self.audit_event(
                "recover_prewarming",
                Outcome::Error,
                serde_json::json!({
                    "attempt": record.provision_attempt,
                    "pendingDestroy": record.instance.as_ref().map(|i| i.contract_id.clone()),
                }),
            )?;
        }
        Ok(repaired)
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    fn spawn_provisioning(&self, attempt: u64, tier: Tier, nsfw: bool) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.provision(attempt, tier, nsfw).await {
                tracing::error!(attempt, error = %err, "Provisioning task aborted");
            }
        });
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let retry = &self.shared.config.retry;
        let deadline = self.shared.config.pool.provision_timeout();
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(deadline, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(deadline)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < retry.attempts() => {
                    let backoff = retry.backoff_for_attempt(attempt);
                    tracing::warn!(
                        op,
                        provider = self.shared.provider.name(),
                        attempt = attempt + 1,
                        ?backoff,
                        error = %err,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceRecord> {
        let provider = &self.shared.provider;
        match self
            .with_retry("create_instance", move || provider.create_instance(spec))
            .await
        {
            Ok(instance) => Ok(instance),
            Err(ProviderError::Timeout(after)) => Err(ControllerError::ProvisioningTimeout(after)),
            Err(err) => Err(ControllerError::no_gpu(err.to_string())),
        }
    }

    async fn provision(&self, attempt: u64, tier: Tier, nsfw: bool) -> Result<()> {
        let spec = InstanceSpec::for_tier(tier, nsfw);
        tracing::info!(
            attempt,
            %tier,
            nsfw,
            min_gpu_ram_gb = spec.min_gpu_ram_gb,
            max_hourly_price = spec.max_hourly_price,
            "Provisioning instance"
        );

        let created = match self.create(&spec).await {
            Ok(instance) => instance,
            Err(err) => return self.abandon(attempt, None, err.to_string()).await,
        };
        let contract_id = created.contract_id.clone();
        tracing::info!(attempt, contract_id = %contract_id, "Instance created, waiting for readiness");

        let recorded = self.mutate(|record| {
            if !record.is_prewarming || record.provision_attempt != attempt {
                return Mutation::Skip(false);
            }
            let mut instance = created.clone();
            instance.status = InstanceStatus::Provisioning;
            record.instance = Some(instance);
            Mutation::Commit(true)
        })?;
        if !recorded {
            return self
                .abandon(attempt, Some(contract_id), "attempt superseded".to_string())
                .await;
        }

        match self.wait_ready(&created).await? {
            Ok(()) => {}
            Err(reason) => return self.abandon(attempt, Some(contract_id), reason).await,
        }

        let promoted = self.mutate(|record| {
            if record.terminate_requested {
                return Mutation::Skip(false);
            }
            match record.instance.as_mut() {
                Some(instance) if instance.contract_id == contract_id => {
                    let now = Utc::now();
                    instance.status = InstanceStatus::Running;
                    instance.last_activity_at = now;
                    record.is_prewarming = false;
                    record.last_error = None;
                    Mutation::Commit(true)
                }
                _ => Mutation::Skip(false),
            }
        })?;
        if !promoted {
            return self
                .abandon(attempt, Some(contract_id), "terminated during provisioning".to_string())
                .await;
        }

        tracing::info!(attempt, contract_id = %contract_id, "Instance warm");
        self.audit_event(
            "provision",
            Outcome::Success,
            serde_json::json!({
                "attempt": attempt,
                "contractId": contract_id,
                "tier": tier,
                "nsfw": nsfw,
            }),
        )
    }

    /// Poll readiness. The outer result carries store failures, the inner
    /// one the reason to give up.
    async fn wait_ready(&self, instance: &InstanceRecord) -> Result<std::result::Result<(), String>> {
        let pool = &self.shared.config.pool;
        let deadline = deadline_after(pool.ready_timeout());
        loop {
            if self.load()?.record.terminate_requested {
                return Ok(Err("terminated during provisioning".to_string()));
            }
            match self.shared.provider.probe_ready(instance).await {
                Ok(true) => return Ok(Ok(())),
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    tracing::debug!(contract_id = %instance.contract_id, error = %err, "Readiness probe failed");
                }
                Err(err) => return Ok(Err(err.to_string())),
            }
            if deadline_after(pool.ready_poll_interval()) > deadline {
                return Ok(Err(format!(
                    "instance {} not ready within {}s",
                    instance.contract_id,
                    pool.ready_timeout().as_secs()
                )));
            }
            tokio::time::sleep(pool.ready_poll_interval()).await;
        }
    }

    /// Give up on an attempt: destroy whatever was created and revert to Empty.
    /// If the destroy itself fails the instance stays `terminating` for the reaper.
    async fn abandon(&self, attempt: u64, contract_id: Option<String>, reason: String) -> Result<()> {
        tracing::error!(attempt, contract_id = ?contract_id, reason = %reason, "Provisioning failed");

        let mut destroy_error = None;
        if let Some(contract_id) = contract_id.as_deref() {
            let provider = &self.shared.provider;
            if let Err(err) = self
                .with_retry("destroy_instance", move || provider.destroy_instance(contract_id))
                .await
            {
                destroy_error = Some(err.to_string());
            }
        }

        let reason_for_record = reason.clone();
        let owned_contract = contract_id.clone();
        let leaked = destroy_error.is_some();
        self.mutate(|record| {
            if record.provision_attempt != attempt {
                return Mutation::Skip(());
            }
            let ours = match (&record.instance, &owned_contract) {
                (Some(instance), Some(id)) => instance.contract_id == *id,
                _ => false,
            };
            if leaked && ours {
                if let Some(instance) = record.instance.as_mut() {
                    instance.status = InstanceStatus::Terminating;
                }
                record.is_prewarming = false;
                record.terminate_requested = false;
            } else if ours || record.instance.is_none() {
                record.clear(Utc::now());
            }
            record.last_error = Some(reason_for_record.clone());
            Mutation::Commit(())
        })?;

        self.audit_event(
            "provision",
            Outcome::Error,
            serde_json::json!({
                "attempt": attempt,
                "contractId": contract_id,
                "error": reason,
                "destroyError": destroy_error,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        creates: AtomicUsize,
        destroys: AtomicUsize,
        fail_creates: bool,
    }

    impl CountingProvider {
        fn new(fail_creates: bool) -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                fail_creates,
            })
        }
    }

    #[async_trait]
    impl CloudProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn create_instance(
            &self,
            _spec: &InstanceSpec,
        ) -> std::result::Result<InstanceRecord, ProviderError> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_creates {
                return Err(ProviderError::Transient(format!("no offers ({n})")));
            }
            Ok(InstanceRecord::provisioning(
                format!("c-{n}"),
                format!("http://gpu-{n}:8188"),
                Utc::now(),
            ))
        }

        async fn destroy_instance(&self, _contract_id: &str) -> std::result::Result<(), ProviderError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> Arc<ControllerConfig> {
        let mut config = ControllerConfig::default();
        config.retry.initial_backoff_ms = 5;
        config.retry.max_backoff_ms = 20;
        config.retry.use_jitter = false;
        config.pool.acquire_timeout_secs = 5;
        Arc::new(config)
    }

    fn controller(provider: Arc<CountingProvider>) -> (PoolController, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let audit = AuditLogger::new(store.clone(), "salt");
        (
            PoolController::new(fast_config(), store.clone(), provider, audit),
            store,
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_warm_instance() {
        let provider = CountingProvider::new(false);
        let (controller, _) = controller(provider.clone());

        let first = controller.acquire("a").await.unwrap();
        let second = controller.acquire("b").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().unwrap().phase(), PoolPhase::Warm);
    }

    #[tokio::test]
    async fn test_failed_provisioning_reverts_to_empty() {
        let provider = CountingProvider::new(true);
        let (controller, _) = controller(provider.clone());

        let err = controller.acquire("a").await.unwrap_err();
        assert_eq!(err.code(), "NO_GPU_AVAILABLE");
        assert!(err.retry_after().is_some());

        // initial attempt plus max_retries
        assert_eq!(provider.creates.load(Ordering::SeqCst), 4);

        let record = controller.status().unwrap();
        assert_eq!(record.phase(), PoolPhase::Empty);
        assert!(record.last_error.is_some());

        let failures = controller
            .audit()
            .query(&crate::audit::LogFilter {
                action: Some("provision".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failures.total, 1);
        assert_eq!(failures.rows[0].outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn test_terminate_clears_record() {
        let provider = CountingProvider::new(false);
        let (controller, _) = controller(provider.clone());
        controller.acquire("a").await.unwrap();

        let outcome = controller.terminate(true).await.unwrap();
        assert_eq!(
            outcome,
            TerminateOutcome::Terminated {
                contract_id: "c-1".into()
            }
        );
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().unwrap().phase(), PoolPhase::Empty);
        assert_eq!(controller.terminate(true).await.unwrap(), TerminateOutcome::AlreadyEmpty);
    }

    #[tokio::test]
    async fn test_manual_terminate_ignores_safe_mode() {
        let provider = CountingProvider::new(false);
        let (controller, _) = controller(provider.clone());
        controller.acquire("a").await.unwrap();
        controller.configure(1, true).unwrap();

        assert_eq!(
            controller.terminate(false).await.unwrap(),
            TerminateOutcome::Terminated {
                contract_id: "c-1".into()
            }
        );
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().unwrap().phase(), PoolPhase::Empty);
    }

    #[tokio::test]
    async fn test_eviction_respects_safe_mode_and_activity() {
        let provider = CountingProvider::new(false);
        let (controller, _) = controller(provider.clone());
        controller.acquire("a").await.unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);

        // recently active
        assert_eq!(
            controller.evict_at(Utc::now()).await.unwrap(),
            TerminateOutcome::Skipped
        );

        controller.configure(1, true).unwrap();
        assert_eq!(controller.evict_at(later).await.unwrap(), TerminateOutcome::Skipped);
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 0);

        controller.configure(1, false).unwrap();
        assert!(matches!(
            controller.evict_at(later).await.unwrap(),
            TerminateOutcome::Terminated { .. }
        ));
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mark_activity_without_instance() {
        let (controller, _) = controller(CountingProvider::new(false));
        assert!(!controller.mark_activity("r").unwrap());
    }

    #[tokio::test]
    async fn test_recover_resets_prewarming() {
        let mut record = PoolRecord::empty(Utc::now());
        record.is_prewarming = true;
        record.provision_attempt = 4;
        let store = Arc::new(MemoryStateStore::with_record(record));
        let audit = AuditLogger::new(store.clone(), "salt");
        let controller =
            PoolController::new(fast_config(), store, CountingProvider::new(false), audit);

        assert!(controller.recover().unwrap());
        let record = controller.status().unwrap();
        assert!(!record.is_prewarming);
        assert_eq!(record.phase(), PoolPhase::Empty);
        assert!(!controller.recover().unwrap());
    }
}
