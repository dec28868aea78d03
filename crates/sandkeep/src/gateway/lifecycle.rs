//! Process lifecycle manager.
//!
//! Makes sure exactly one gateway process runs in the container and only
//! hands it out once its control endpoint answers. Concurrent callers are
//! serialized on a start lock: whoever comes second re-reads the process
//! table and finds the instance the first caller started.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{GatewayError, GatewayResult, ProcessStartFailure};
use super::launch::{GatewayLaunch, HalfStartedPolicy};
use super::readiness::{Readiness, ReadinessProbe, WaitOptions, wait_until_ready};
use super::registry::{ProcessInfo, ProcessRegistry, ProcessStatus, redact_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    NotStarted,
    Starting,
    Ready,
    /// Started or seen earlier, no longer running.
    Crashed,
    /// Running but did not become ready in time.
    Unready,
}

/// Handle to the gateway process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayProcess {
    pub pid: u32,
    pub port: u16,
    pub bind: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub state: GatewayState,
    /// Found already running rather than started by this supervisor.
    pub adopted: bool,
}

/// Lifecycle view for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub state: GatewayState,
    pub process: Option<GatewayProcess>,
    /// Processes started by this supervisor.
    pub starts: u64,
}

pub struct GatewayManager {
    launch: GatewayLaunch,
    registry: Arc<dyn ProcessRegistry>,
    probe: Arc<dyn ReadinessProbe>,
    startup: WaitOptions,
    half_started: HalfStartedPolicy,
    start_lock: Mutex<()>,
    current: RwLock<Option<GatewayProcess>>,
    state_tx: watch::Sender<GatewayState>,
    starts: AtomicU64,
}

impl GatewayManager {
    pub fn new(
        launch: GatewayLaunch,
        registry: Arc<dyn ProcessRegistry>,
        probe: Arc<dyn ReadinessProbe>,
        startup: WaitOptions,
        half_started: HalfStartedPolicy,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(GatewayState::NotStarted);
        Self {
            launch,
            registry,
            probe,
            startup,
            half_started,
            start_lock: Mutex::new(()),
            current: RwLock::new(None),
            state_tx,
            starts: AtomicU64::new(0),
        }
    }

    pub fn launch(&self) -> &GatewayLaunch {
        &self.launch
    }

    pub fn state(&self) -> GatewayState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the gateway has been observed ready at least once.
    pub async fn wait_first_ready(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == GatewayState::Ready).await;
    }

    fn current(&self) -> Option<GatewayProcess> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_current(&self, process: Option<GatewayProcess>) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = process;
    }

    fn set_state(&self, state: GatewayState) {
        if let Some(process) = self
            .current
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .as_mut()
        {
            process.state = state;
        }
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Return a ready gateway, starting one if none is running.
    pub async fn ensure_running(&self, cancel: &CancellationToken) -> GatewayResult<GatewayProcess> {
        let _guard = self.start_lock.lock().await;

        let matching = self.registry.list_matching(&self.launch.signature).await?;
        if let Some(existing) = matching.first() {
            if matching.len() > 1 {
                warn!(
                    "{} gateway processes match; using pid {}",
                    matching.len(),
                    existing.pid
                );
            }
            self.track(existing);

            if self.probe.probe(&self.launch.endpoint).await {
                self.set_state(GatewayState::Ready);
                return self.ready_handle(existing.pid);
            }

            match self.half_started {
                HalfStartedPolicy::Wait => {
                    info!(
                        "Gateway pid {} is running but not answering; waiting for readiness",
                        existing.pid
                    );
                    self.set_state(GatewayState::Starting);
                    return self.await_ready(existing.pid, cancel).await;
                }
                HalfStartedPolicy::Restart => {
                    for process in &matching {
                        warn!(
                            "Gateway pid {} is running but not answering; restarting",
                            process.pid
                        );
                        self.registry.terminate(process.pid).await;
                    }
                    self.set_state(GatewayState::Crashed);
                }
            }
        } else if let Some(previous) = self.current() {
            if previous.state != GatewayState::Crashed {
                let status = self.registry.status(previous.pid).await;
                warn!(
                    "Gateway pid {} is no longer running ({:?}); starting a fresh instance",
                    previous.pid, status
                );
                self.set_state(GatewayState::Crashed);
            }
        }

        self.start_fresh(cancel).await
    }

    /// Record a process found in the table, keeping what we know about it.
    fn track(&self, found: &ProcessInfo) {
        let known = self.current().filter(|p| p.pid == found.pid);
        if known.is_none() {
            info!("Found running gateway pid {}", found.pid);
            self.set_current(Some(GatewayProcess {
                pid: found.pid,
                port: self.launch.spec.port,
                bind: self.launch.bind.clone(),
                args: found.command.iter().skip(1).cloned().collect(),
                started_at: found.started_at.unwrap_or_else(Utc::now),
                state: self.state(),
                adopted: true,
            }));
        }
    }

    async fn start_fresh(&self, cancel: &CancellationToken) -> GatewayResult<GatewayProcess> {
        let port = self.launch.spec.port;
        if let Some(holder) = self.registry.port_holder(port).await {
            return Err(ProcessStartFailure::PortInUse {
                port,
                holder: Some(holder),
            }
            .into());
        }

        remove_stale_locks(&self.launch.stale_lock_files).await;

        let info = match self.registry.start(&self.launch.spec).await {
            Ok(info) => info,
            Err(e) => {
                if self.current().is_none() {
                    self.set_state(GatewayState::NotStarted);
                }
                return Err(e);
            }
        };
        self.starts.fetch_add(1, Ordering::Relaxed);

        self.set_current(Some(GatewayProcess {
            pid: info.pid,
            port,
            bind: self.launch.bind.clone(),
            args: redact_args(&self.launch.spec.args),
            started_at: info.started_at.unwrap_or_else(Utc::now),
            state: GatewayState::Starting,
            adopted: false,
        }));
        self.set_state(GatewayState::Starting);

        self.await_ready(info.pid, cancel).await
    }

    /// Wait for readiness while watching for the process to exit.
    async fn await_ready(&self, pid: u32, cancel: &CancellationToken) -> GatewayResult<GatewayProcess> {
        let wait = wait_until_ready(self.probe.as_ref(), &self.launch.endpoint, self.startup, cancel);

        tokio::select! {
            readiness = wait => match readiness {
                Readiness::Ready { attempts, elapsed } => {
                    info!("Gateway pid {} ready after {} probe(s) in {:?}", pid, attempts, elapsed);
                    self.set_state(GatewayState::Ready);
                    self.ready_handle(pid)
                }
                Readiness::TimedOut { elapsed, .. } | Readiness::Cancelled { elapsed, .. } => {
                    warn!("Gateway pid {} not ready after {:?}", pid, elapsed);
                    self.set_state(GatewayState::Unready);
                    Err(GatewayError::ReadinessTimeout {
                        pid: Some(pid),
                        timeout: elapsed,
                    })
                }
            },
            status = self.watch_exit(pid) => {
                let output = self.registry.recent_output(pid).await;
                warn!("Gateway pid {} {} before becoming ready", pid, status);
                self.set_state(GatewayState::Crashed);
                Err(ProcessStartFailure::ExitedEarly { status, output }.into())
            }
        }
    }

    /// Resolve with an exit description once `pid` stops running.
    async fn watch_exit(&self, pid: u32) -> String {
        loop {
            match self.registry.status(pid).await {
                ProcessStatus::Running => tokio::time::sleep(self.startup.interval).await,
                ProcessStatus::Exited { status } => return status,
                ProcessStatus::Gone => return "exited (unknown status)".to_string(),
            }
        }
    }

    fn ready_handle(&self, pid: u32) -> GatewayResult<GatewayProcess> {
        self.current()
            .filter(|p| p.pid == pid)
            .ok_or(GatewayError::ReadinessTimeout {
                pid: Some(pid),
                timeout: self.startup.timeout,
            })
    }

    /// Re-check the tracked process and report `crashed` if it has gone.
    pub async fn refresh(&self) -> GatewaySnapshot {
        if let Some(process) = self.current() {
            let alive_state = matches!(
                process.state,
                GatewayState::Ready | GatewayState::Unready | GatewayState::Starting
            );
            if alive_state && self.registry.status(process.pid).await != ProcessStatus::Running {
                warn!("Gateway pid {} has exited", process.pid);
                self.set_state(GatewayState::Crashed);
            }
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            state: self.state(),
            process: self.current(),
            starts: self.starts.load(Ordering::Relaxed),
        }
    }
}

/// Remove lock files a previous gateway left behind.
async fn remove_stale_locks(paths: &[impl AsRef<Path>]) {
    for path in paths {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Removed stale lock {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove {}: {}", path.display(), e),
        }
    }
}
