//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Notify;

use sandkeep::config::GatewayConfig;
use sandkeep::failure::FailureLedger;
use sandkeep::gateway::{
    CommandSignature, GatewayEndpoint, GatewayError, GatewayLaunch, GatewayManager, GatewayResult,
    HalfStartedPolicy, LaunchSpec, ProcessInfo, ProcessRegistry, ProcessStartFailure,
    ProcessStatus, ReadinessProbe, WaitOptions,
};
use sandkeep::persist::{
    BuiltinTransfer, FileTransfer, RestorePolicy, SyncEngine, SyncMarker, SyncSettings,
    TransferError, TransferReport, TransferResult,
};
use sandkeep::storage::{
    BucketMounter, MountEntry, MountError, MountManager, MountRequest, MountResult, MountTable,
};
use sandkeep::supervisor::{Supervisor, SupervisorParts};

pub const MARKER: &str = ".last-sync";

pub fn write(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

/// Write a sync marker with `epoch` into `dir`.
pub fn write_marker(dir: &Path, epoch: u64) {
    let marker = SyncMarker {
        epoch,
        completed_at: Utc::now(),
        entries: 1,
    };
    write(&dir.join(MARKER), &serde_json::to_string(&marker).unwrap());
}

pub fn builtin_transfer() -> Arc<dyn FileTransfer> {
    Arc::new(BuiltinTransfer::new(&[MARKER.to_string()]).unwrap())
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTable {
    mounted: Mutex<Vec<PathBuf>>,
}

impl FakeTable {
    /// Drop every entry, as if the FUSE mount died.
    pub fn clear(&self) {
        self.mounted.lock().unwrap().clear();
    }
}

impl MountTable for FakeTable {
    fn entries(&self) -> std::io::Result<Vec<MountEntry>> {
        Ok(self
            .mounted
            .lock()
            .unwrap()
            .iter()
            .map(|p| MountEntry {
                source: "s3fs".to_string(),
                target: p.clone(),
                fstype: "fuse.s3fs".to_string(),
            })
            .collect())
    }
}

/// Registers the mount path in a [`FakeTable`] after a short delay.
pub struct FakeMounter {
    pub table: Arc<FakeTable>,
    pub calls: AtomicU32,
    pub fail: bool,
    pub delay: Duration,
}

#[async_trait]
impl BucketMounter for FakeMounter {
    async fn mount(&self, request: &MountRequest) -> MountResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(MountError::CredentialsMissing("R2_ACCESS_KEY_ID".to_string()));
        }
        self.table
            .mounted
            .lock()
            .unwrap()
            .push(request.mount_path.clone());
        Ok(())
    }
}

pub fn mount_manager(mount_path: &Path, fail: bool) -> (Arc<MountManager>, Arc<FakeMounter>) {
    let table = Arc::new(FakeTable::default());
    let mounter = Arc::new(FakeMounter {
        table: table.clone(),
        calls: AtomicU32::new(0),
        fail,
        delay: Duration::from_millis(20),
    });
    let request = MountRequest {
        bucket: "moltbot-data".to_string(),
        mount_path: mount_path.to_path_buf(),
        endpoint: None,
    };
    let manager = Arc::new(MountManager::new(request, mounter.clone(), table));
    (manager, mounter)
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Builtin transfer that blocks until released.
pub struct GatedTransfer {
    inner: Arc<dyn FileTransfer>,
    pub started: Notify,
    pub release: Notify,
    pub calls: AtomicU32,
}

impl GatedTransfer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: builtin_transfer(),
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl FileTransfer for GatedTransfer {
    async fn transfer(&self, source: &Path, destination: &Path) -> TransferResult<TransferReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        self.inner.transfer(source, destination).await
    }
}

/// Fails the first transfer with an io error, then behaves like the builtin
/// backend.
pub struct FailFirstTransfer {
    inner: Arc<dyn FileTransfer>,
    pub calls: AtomicU32,
}

impl FailFirstTransfer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: builtin_transfer(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl FileTransfer for FailFirstTransfer {
    async fn transfer(&self, source: &Path, destination: &Path) -> TransferResult<TransferReport> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TransferError::Io(std::io::Error::other("connection reset")));
        }
        self.inner.transfer(source, destination).await
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

struct FakeProcess {
    command: Vec<String>,
    running: bool,
    exit: Option<String>,
    /// Whether this process answers on the control port.
    answers: bool,
}

/// How processes started through the registry behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    /// Runs and answers the readiness probe.
    Healthy,
    /// Runs but never answers.
    Silent,
    /// Exits right away with code 1.
    ExitImmediately,
}

/// In-memory process table.
pub struct FakeRegistry {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    next_pid: AtomicU32,
    pub starts: AtomicU32,
    pub terminated: Mutex<Vec<u32>>,
    pub behavior: Mutex<StartBehavior>,
    pub port_holder: Mutex<Option<String>>,
}

impl FakeRegistry {
    pub fn new(behavior: StartBehavior) -> Arc<Self> {
        Arc::new(Self {
            processes: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
            starts: AtomicU32::new(0),
            terminated: Mutex::new(Vec::new()),
            behavior: Mutex::new(behavior),
            port_holder: Mutex::new(None),
        })
    }

    fn insert(&self, command: Vec<String>, running: bool, answers: bool, exit: Option<String>) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(
            pid,
            FakeProcess {
                command,
                running,
                exit,
                answers,
            },
        );
        pid
    }

    /// A gateway that was already running before the supervisor came up.
    pub fn spawn_external(&self, answers: bool) -> u32 {
        let command = ["clawdbot", "gateway", "--port", "18789", "--bind", "lan"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.insert(command, true, answers, None)
    }

    /// Simulate the process dying.
    pub fn crash(&self, pid: u32) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
            process.running = false;
            process.exit = Some("killed by signal 9".to_string());
        }
    }

    pub fn set_answering(&self, pid: u32, answers: bool) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
            process.answers = answers;
        }
    }

    pub fn running(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.running)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    fn any_answering(&self) -> bool {
        self.processes
            .lock()
            .unwrap()
            .values()
            .any(|p| p.running && p.answers)
    }
}

#[async_trait]
impl ProcessRegistry for FakeRegistry {
    async fn list_matching(&self, signature: &CommandSignature) -> GatewayResult<Vec<ProcessInfo>> {
        let mut found: Vec<ProcessInfo> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.running && signature.matches(&p.command))
            .map(|(pid, p)| ProcessInfo {
                pid: *pid,
                command: p.command.clone(),
                started_at: None,
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        Ok(found)
    }

    async fn start(&self, spec: &LaunchSpec) -> GatewayResult<ProcessInfo> {
        // Widen the window between "nothing running" and "started".
        tokio::task::yield_now().await;

        let mut command = vec![spec.binary.clone()];
        command.extend(spec.args.iter().cloned());

        let behavior = *self.behavior.lock().unwrap();
        let pid = match behavior {
            StartBehavior::Healthy => self.insert(command.clone(), true, true, None),
            StartBehavior::Silent => self.insert(command.clone(), true, false, None),
            StartBehavior::ExitImmediately => self.insert(
                command.clone(),
                false,
                false,
                Some("exited with code 1".to_string()),
            ),
        };
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessInfo {
            pid,
            command,
            started_at: Some(Utc::now()),
        })
    }

    async fn status(&self, pid: u32) -> ProcessStatus {
        match self.processes.lock().unwrap().get(&pid) {
            Some(p) if p.running => ProcessStatus::Running,
            Some(p) => ProcessStatus::Exited {
                status: p.exit.clone().unwrap_or_else(|| "exited".to_string()),
            },
            None => ProcessStatus::Gone,
        }
    }

    async fn terminate(&self, pid: u32) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
            process.running = false;
            process.exit = Some("killed by signal 15".to_string());
        }
        self.terminated.lock().unwrap().push(pid);
    }

    async fn port_holder(&self, _port: u16) -> Option<String> {
        self.port_holder.lock().unwrap().clone()
    }

    async fn recent_output(&self, pid: u32) -> Vec<String> {
        match self.processes.lock().unwrap().get(&pid) {
            Some(p) if !p.running => vec!["Error: invalid config".to_string()],
            _ => Vec::new(),
        }
    }
}

/// Answers when any running fake process answers.
pub struct FakeProbe {
    registry: Arc<FakeRegistry>,
    pub probes: AtomicU64,
    pub blocked: AtomicBool,
}

impl FakeProbe {
    pub fn new(registry: Arc<FakeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            probes: AtomicU64::new(0),
            blocked: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn probe(&self, _endpoint: &GatewayEndpoint) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !self.blocked.load(Ordering::SeqCst) && self.registry.any_answering()
    }
}

pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        stale_lock_files: Vec::new(),
        ..GatewayConfig::default()
    }
}

pub fn gateway_manager(
    registry: Arc<FakeRegistry>,
    probe: Arc<FakeProbe>,
    startup: WaitOptions,
    half_started: HalfStartedPolicy,
) -> Arc<GatewayManager> {
    let launch = GatewayLaunch::new(&gateway_config(), &HashMap::<String, String>::new());
    Arc::new(GatewayManager::new(
        launch,
        registry,
        probe,
        startup,
        half_started,
    ))
}

pub fn is_port_in_use(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::ProcessStart(ProcessStartFailure::PortInUse { .. })
    )
}

// ---------------------------------------------------------------------------
// Whole supervisor
// ---------------------------------------------------------------------------

pub struct HarnessOptions {
    pub mount_fails: bool,
    pub storage_required: bool,
    pub behavior: StartBehavior,
    pub half_started: HalfStartedPolicy,
    pub startup: WaitOptions,
    pub sync_interval: Duration,
    pub sync_on_shutdown: bool,
    /// Backend shared by restore and sync; builtin when unset.
    pub transfer: Option<Arc<dyn FileTransfer>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mount_fails: false,
            storage_required: false,
            behavior: StartBehavior::Healthy,
            half_started: HalfStartedPolicy::Wait,
            startup: WaitOptions::new(Duration::from_secs(2), Duration::from_millis(20)),
            sync_interval: Duration::from_secs(300),
            sync_on_shutdown: true,
            transfer: None,
        }
    }
}

/// A supervisor wired to fakes, with its directories under a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub local: PathBuf,
    pub remote: PathBuf,
    pub mounter: Arc<FakeMounter>,
    pub mount: Arc<MountManager>,
    pub registry: Arc<FakeRegistry>,
    pub probe: Arc<FakeProbe>,
    pub sync: Arc<SyncEngine>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(opts: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mount_path = dir.path().join("mnt");
        let remote = mount_path.join("clawdbot");
        let local = dir.path().join("home").join(".clawdbot");

        let ledger = Arc::new(FailureLedger::new());
        let (mount, mounter) = mount_manager(&mount_path, opts.mount_fails);

        let transfer = opts.transfer.clone().unwrap_or_else(builtin_transfer);
        let sync = Arc::new(SyncEngine::new(
            SyncSettings {
                local_dir: local.clone(),
                remote_dir: remote.clone(),
                marker_file: MARKER.to_string(),
                required_files: vec!["clawdbot.json".to_string()],
            },
            transfer.clone(),
            mount.clone(),
            ledger.clone(),
        ));

        let registry = FakeRegistry::new(opts.behavior);
        let probe = FakeProbe::new(registry.clone());
        let gateway = gateway_manager(
            registry.clone(),
            probe.clone(),
            opts.startup,
            opts.half_started,
        );

        let supervisor = Arc::new(Supervisor::new(SupervisorParts {
            mount: mount.clone(),
            restore: RestorePolicy::new(MARKER, transfer),
            sync: sync.clone(),
            gateway,
            ledger,
            local_dir: local.clone(),
            remote_dir: remote.clone(),
            storage_required: opts.storage_required,
            sync_interval: opts.sync_interval,
            sync_on_shutdown: opts.sync_on_shutdown,
        }));

        Self {
            dir,
            local,
            remote,
            mounter,
            mount,
            registry,
            probe,
            sync,
            supervisor,
        }
    }
}
