//! Boot ordering and the outward interfaces.
//!
//! Mount, then restore (once), then the gateway. The periodic sync loop only
//! starts after the gateway has been ready once.

mod status;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use status::{BootReport, StatusReport};

use crate::config::AppConfig;
use crate::failure::{Classified, FailureLedger};
use crate::gateway::{
    GatewayError, GatewayLaunch, GatewayManager, GatewayProcess, OsProcessRegistry,
    ProcessRegistry, WaitOptions, probe_for,
};
use crate::persist::{
    RestoreDecision, RestorePolicy, SyncEngine, SyncRun, SyncSettings, SyncTrigger,
    transfer_from_config,
};
use crate::secrets::SecretSource;
use crate::storage::{
    MountError, MountManager, MountRequest, MountStatus, ProcMountTable, S3fsMounter,
};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("remote storage is required but not mounted: {0}")]
    StorageRequired(#[from] MountError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::StorageRequired(_) => "storage_unavailable",
            SupervisorError::Gateway(e) => e.code(),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            SupervisorError::StorageRequired(e) => e.summary(),
            SupervisorError::Gateway(e) => e.summary(),
        }
    }
}

/// Components the supervisor drives.
pub struct SupervisorParts {
    pub mount: Arc<MountManager>,
    pub restore: RestorePolicy,
    pub sync: Arc<SyncEngine>,
    pub gateway: Arc<GatewayManager>,
    pub ledger: Arc<FailureLedger>,
    pub local_dir: PathBuf,
    pub remote_dir: PathBuf,
    pub storage_required: bool,
    pub sync_interval: Duration,
    pub sync_on_shutdown: bool,
}

pub struct Supervisor {
    mount: Arc<MountManager>,
    restore: RestorePolicy,
    sync: Arc<SyncEngine>,
    gateway: Arc<GatewayManager>,
    ledger: Arc<FailureLedger>,
    local_dir: PathBuf,
    remote_dir: PathBuf,
    storage_required: bool,
    sync_interval: Duration,
    sync_on_shutdown: bool,
    prepared: OnceCell<RestoreDecision>,
    cancel: CancellationToken,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(parts: SupervisorParts) -> Self {
        Self {
            mount: parts.mount,
            restore: parts.restore,
            sync: parts.sync,
            gateway: parts.gateway,
            ledger: parts.ledger,
            local_dir: parts.local_dir,
            remote_dir: parts.remote_dir,
            storage_required: parts.storage_required,
            sync_interval: parts.sync_interval,
            sync_on_shutdown: parts.sync_on_shutdown,
            prepared: OnceCell::new(),
            cancel: CancellationToken::new(),
            periodic: Mutex::new(None),
        }
    }

    /// Wire up the real mount tool, transfer backend and process table.
    pub fn from_config(config: &AppConfig, secrets: Arc<dyn SecretSource>) -> Result<Self> {
        let ledger = Arc::new(FailureLedger::new());

        let mounter = Arc::new(S3fsMounter::new(&config.storage, secrets.clone()));
        let mount = Arc::new(MountManager::new(
            MountRequest::from_config(&config.storage),
            mounter,
            Arc::new(ProcMountTable::new()),
        ));

        let transfer = transfer_from_config(&config.sync).context("building transfer backend")?;
        let restore = RestorePolicy::new(config.sync.marker_file.clone(), transfer.clone());
        let sync = Arc::new(SyncEngine::new(
            SyncSettings::from_config(config),
            transfer,
            mount.clone(),
            ledger.clone(),
        ));

        let launch = GatewayLaunch::new(&config.gateway, secrets.as_ref());
        let registry: Arc<dyn ProcessRegistry> =
            Arc::new(OsProcessRegistry::new(config.gateway.output_lines));
        let gateway = Arc::new(GatewayManager::new(
            launch,
            registry,
            probe_for(&config.readiness),
            WaitOptions::startup(&config.readiness),
            config.gateway.half_started,
        ));

        Ok(Self::new(SupervisorParts {
            mount,
            restore,
            sync,
            gateway,
            ledger,
            local_dir: config.local_state_dir(),
            remote_dir: config.remote_state_dir(),
            storage_required: config.storage.required,
            sync_interval: config.sync.interval(),
            sync_on_shutdown: config.sync.on_shutdown,
        }))
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Mount and restore, exactly once per supervisor lifetime.
    ///
    /// A mount failure is recorded and tolerated unless storage is
    /// required, in which case the next call tries again.
    pub async fn prepare_state(&self) -> Result<&RestoreDecision, SupervisorError> {
        self.prepared
            .get_or_try_init(|| async {
                if let Err(e) = self.mount.ensure_mounted().await {
                    self.ledger.record(&e);
                    if self.storage_required {
                        error!("Remote storage unavailable: {}", e.summary());
                        return Err(SupervisorError::StorageRequired(e));
                    }
                    warn!(
                        "Continuing without durable storage: {}",
                        e.summary()
                    );
                }

                let decision = if self.mount.status() == MountStatus::Mounted {
                    let report = self
                        .restore
                        .decide_and_restore(&self.local_dir, &self.remote_dir)
                        .await;
                    if let Some(ref e) = report.error {
                        self.ledger.record(e);
                        // Local state may be older than remote.
                        self.sync.hold_for_failed_restore();
                    }
                    report.decision
                } else {
                    RestoreDecision::storage_unavailable()
                };

                self.sync.arm();
                Ok(decision)
            })
            .await
    }

    pub fn restore_decision(&self) -> Option<&RestoreDecision> {
        self.prepared.get()
    }

    /// Idempotent "make sure the gateway is up".
    pub async fn ensure_gateway_running(&self) -> Result<GatewayProcess, SupervisorError> {
        self.prepare_state().await?;
        match self.gateway.ensure_running(&self.cancel).await {
            Ok(process) => Ok(process),
            Err(e) => {
                self.ledger.record(&e);
                error!("Gateway unavailable: {}", e.summary());
                Err(e.into())
            }
        }
    }

    /// Container boot: storage, restore, gateway.
    pub async fn boot(&self) -> Result<BootReport, SupervisorError> {
        info!("Boot: preparing durable state");
        let restore = self.prepare_state().await?.clone();

        info!("Boot: starting gateway");
        let gateway_ready = match self.ensure_gateway_running().await {
            Ok(process) => {
                info!("Gateway ready (pid {})", process.pid);
                true
            }
            // Callers retry through ensure_gateway_running.
            Err(_) => false,
        };

        Ok(BootReport {
            mounted: self.mount.status() == MountStatus::Mounted,
            restore,
            gateway_ready,
        })
    }

    /// Start the periodic sync loop once the gateway has been ready once.
    pub fn spawn_periodic_sync(&self) {
        let mut slot = self.periodic.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }

        let gateway = self.gateway.clone();
        let sync = self.sync.clone();
        let cancel = self.cancel.clone();
        let interval = self.sync_interval;
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = gateway.wait_first_ready() => {}
            }
            sync.run_periodic(interval, cancel).await;
        }));
    }

    pub async fn trigger_manual_sync(&self) -> SyncRun {
        self.sync.run_sync(SyncTrigger::Manual).await
    }

    /// Stop background work and optionally push a final time.
    ///
    /// The gateway process is left running.
    pub async fn shutdown(&self) -> Option<SyncRun> {
        self.cancel.cancel();
        let handle = self
            .periodic
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Periodic sync task ended abnormally: {}", e);
            }
        }

        if self.sync_on_shutdown && self.sync.is_armed() {
            info!("Running final sync before shutdown");
            Some(self.sync.run_sync(SyncTrigger::Shutdown).await)
        } else {
            None
        }
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            mount: self.mount.snapshot().await,
            restore: self.restore_decision().cloned(),
            sync: self.sync.snapshot(),
            gateway: self.gateway.refresh().await,
            failures: self.ledger.snapshot(),
        }
    }
}
