//! Shared fixtures for the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use warmpool_core::{
    AuditLogger, CloudProvider, ControllerConfig, InstanceRecord, InstanceSpec, MemoryStateStore,
    PoolController, ProviderError, StateStore,
};

/// Provider double that counts calls and tracks how many instances it has
/// handed out without a matching destroy
pub struct StubProvider {
    pub delay: Duration,
    pub fail_creates: AtomicBool,
    pub fail_destroys: AtomicBool,
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
    outstanding: AtomicUsize,
    pub max_outstanding: AtomicUsize,
}

impl StubProvider {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_creates: AtomicBool::new(false),
            fail_destroys: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
        })
    }

    pub fn failing(delay: Duration) -> Arc<Self> {
        let provider = Self::new(delay);
        provider.fail_creates.store(true, Ordering::SeqCst);
        provider
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn create_instance(&self, _spec: &InstanceSpec) -> Result<InstanceRecord, ProviderError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient(format!("no offers (call {n})")));
        }
        let live = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(live, Ordering::SeqCst);
        Ok(InstanceRecord::provisioning(
            format!("contract-{n}"),
            format!("http://gpu-{n}.test:8188"),
            Utc::now(),
        ))
    }

    async fn destroy_instance(&self, _contract_id: &str) -> Result<(), ProviderError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroys.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected("destroy refused".into()));
        }
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        Ok(())
    }
}

/// Defaults with millisecond backoff so failure paths finish quickly
pub fn fast_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 20;
    config.retry.use_jitter = false;
    config.pool.acquire_timeout_secs = 5;
    config.engine.poll_interval_ms = 5;
    config.engine.job_timeout_secs = 2;
    config.admin.audit_salt = "test-salt".into();
    config
}

pub fn controller_with(
    config: ControllerConfig,
    store: Arc<dyn StateStore>,
    provider: Arc<StubProvider>,
) -> PoolController {
    let audit = AuditLogger::new(store.clone(), config.admin.audit_salt.clone());
    PoolController::new(Arc::new(config), store, provider, audit)
}

pub fn controller(provider: Arc<StubProvider>) -> PoolController {
    controller_with(fast_config(), Arc::new(MemoryStateStore::new()), provider)
}
