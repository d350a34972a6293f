//! Warmpool Daemon
//!
//! Runs the warm pool controller: admin HTTP surface plus the idle reaper.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, durable state in $XDG_DATA_HOME/warmpool
//! WARMPOOL_ADMIN_KEY=... warmpool-daemon
//!
//! # In-memory state, custom listen address
//! warmpool-daemon --ephemeral --listen 0.0.0.0:8787
//!
//! # With verbose logging
//! RUST_LOG=debug warmpool-daemon
//! ```
//!
//! # Configuration
//!
//! Defaults, then `--config` (or `$XDG_CONFIG_HOME/warmpool/controller.toml`),
//! then `WARMPOOL_*` environment variables, then the flags below.
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: graceful shutdown
//!
//! The process exits non-zero if the state store fails; it must be restarted
//! rather than keep running on a record it cannot trust.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use warmpool_core::{
    ApiState, AuditLogger, ControllerConfig, FileStateStore, HttpCloudProvider, IdleReaper,
    MemoryStateStore, PoolController, StateStore,
};

/// Warm GPU pool controller
#[derive(Debug, Parser)]
#[command(name = "warmpool-daemon", version, about)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "WARMPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Admin API listen address
    #[arg(long)]
    listen: Option<String>,

    /// Directory for durable state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long, env = "WARMPOOL_EPHEMERAL")]
    ephemeral: bool,

    /// Evict the warm instance after this many idle minutes
    #[arg(long)]
    idle_minutes: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut ControllerConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        if self.ephemeral {
            config.storage.ephemeral = true;
        }
        if let Some(minutes) = self.idle_minutes {
            config.pool.idle_minutes = minutes;
        }
    }
}

fn open_store(config: &ControllerConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    if config.storage.ephemeral {
        warn!("Using in-memory state; pool record and audit log are lost on exit");
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    let dir = config.storage.resolved_data_dir();
    let store = FileStateStore::open(&dir)
        .with_context(|| format!("Failed to open state store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warmpool_daemon=info".parse()?)
                .add_directive("warmpool_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    info!("Starting warmpool daemon");

    let mut config =
        ControllerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    if config.admin.api_key.is_none() {
        warn!("No admin key configured; every admin request will be refused");
    }
    let config = Arc::new(config);

    let store = open_store(&config)?;
    let provider = HttpCloudProvider::from_settings(&config.provider)
        .context("Failed to build provider client")?;
    info!(base_url = %config.provider.base_url, "Provider client ready");
    let provider = Arc::new(provider);
    let audit = AuditLogger::new(store.clone(), config.admin.audit_salt.clone());
    let controller = PoolController::new(config.clone(), store, provider, audit);

    if controller.recover().context("Failed to recover pool state")? {
        warn!("Abandoned provisioning attempt from a previous run");
    }
    let record = controller.status()?;
    info!(
        phase = ?record.phase(),
        desired_size = record.desired_size,
        safe_mode = record.safe_mode,
        "Pool state loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(IdleReaper::new(controller.clone()).run(shutdown_rx));

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;

    let mut fatal = controller.subscribe_fatal();
    let stop = shutdown_tx.clone();
    let server = tokio::spawn(warmpool_core::serve(
        listener,
        ApiState::new(controller.clone()),
        async move {
            let mut stopped = stop.subscribe();
            let _ = stopped.wait_for(|stop| *stop).await;
        },
    ));

    let fatal_reason = tokio::select! {
        () = shutdown_signal() => None,
        changed = fatal.wait_for(Option::is_some) => {
            changed.ok().and_then(|reason| (*reason).clone())
        }
    };

    info!("Shutting down");
    shutdown_tx.send_replace(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Admin API stopped with error"),
        Err(e) => error!(error = %e, "Admin API task panicked"),
    }
    if let Err(e) = reaper.await {
        error!(error = %e, "Reaper task panicked");
    }

    if let Some(reason) = fatal_reason {
        error!(reason = %reason, "State store failed; exiting for restart");
        anyhow::bail!("state store failure: {reason}");
    }

    info!("Warmpool daemon stopped");
    Ok(())
}
