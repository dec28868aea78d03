//! Process registry.
//!
//! Finds, starts and stops processes inside the container. The lifecycle
//! manager only talks to the [`ProcessRegistry`] trait, so tests substitute
//! an in-memory registry for the OS process table.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rustix::process::{Pid, Signal, kill_process};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::error::{GatewayError, GatewayResult, ProcessStartFailure};

/// Identifies gateway processes in the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSignature {
    /// Executable basename, e.g. `clawdbot`.
    pub program: String,
    /// Arguments that must all be present, e.g. `gateway`.
    pub args: Vec<String>,
}

impl CommandSignature {
    pub fn new(program: impl AsRef<str>, args: Vec<String>) -> Self {
        Self {
            program: basename(program.as_ref()).to_string(),
            args,
        }
    }

    /// Whether `argv` belongs to a matching process.
    ///
    /// The program may appear as `argv[0]` or, for interpreted launchers
    /// (`node /usr/bin/clawdbot ...`), as `argv[1]`.
    pub fn matches(&self, argv: &[String]) -> bool {
        let program_at = argv
            .iter()
            .take(2)
            .position(|a| basename(a) == self.program);
        match program_at {
            Some(idx) => {
                let rest = &argv[idx + 1..];
                self.args.iter().all(|arg| rest.contains(arg))
            }
            None => false,
        }
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Everything needed to start a process.
#[derive(Clone)]
pub struct LaunchSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub port: u16,
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("binary", &self.binary)
            .field("args", &redact_args(&self.args))
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .field("port", &self.port)
            .finish()
    }
}

/// Replace the value following `--token` for logging.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("<redacted>".to_string());
            hide_next = false;
        } else {
            hide_next = arg == "--token";
            out.push(arg.clone());
        }
    }
    out
}

/// A process found in, or added to, the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: Vec<String>,
    /// When this registry started it, if it did.
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    /// Exited, with a readable exit status (known for processes we started).
    Exited { status: String },
    /// No longer in the process table.
    Gone,
}

/// Container process API.
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Live processes matching `signature`.
    async fn list_matching(&self, signature: &CommandSignature) -> GatewayResult<Vec<ProcessInfo>>;

    /// Start a process detached from the caller's lifetime.
    async fn start(&self, spec: &LaunchSpec) -> GatewayResult<ProcessInfo>;

    async fn status(&self, pid: u32) -> ProcessStatus;

    /// Stop a process, escalating to SIGKILL if it does not exit.
    async fn terminate(&self, pid: u32);

    /// Describe whatever holds `port`, or `None` if the port is free.
    async fn port_holder(&self, port: u16) -> Option<String>;

    /// Most recent output lines of a process started by this registry.
    async fn recent_output(&self, pid: u32) -> Vec<String>;
}

/// Bounded buffer of recent output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug)]
struct ChildRecord {
    output: Arc<Mutex<OutputBuffer>>,
    exit: Option<String>,
}

/// Registry backed by `/proc` and real child processes.
#[derive(Debug, Clone)]
pub struct OsProcessRegistry {
    proc_root: PathBuf,
    output_lines: usize,
    children: Arc<Mutex<HashMap<u32, ChildRecord>>>,
}

/// Lines of output attached to an early-exit error.
const OUTPUT_TAIL: usize = 20;

impl OsProcessRegistry {
    pub fn new(output_lines: usize) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            output_lines,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn record_exit(&self, pid: u32, status: String) {
        let mut children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = children.get_mut(&pid) {
            record.exit = Some(status);
        }
    }

    fn known_exit(&self, pid: u32) -> Option<String> {
        let children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        children.get(&pid).and_then(|r| r.exit.clone())
    }
}

#[async_trait]
impl ProcessRegistry for OsProcessRegistry {
    async fn list_matching(&self, signature: &CommandSignature) -> GatewayResult<Vec<ProcessInfo>> {
        let root = self.proc_root.clone();
        let signature = signature.clone();
        let found = tokio::task::spawn_blocking(move || scan_proc(&root, &signature))
            .await
            .map_err(|e| GatewayError::Registry(std::io::Error::other(e)))?
            .map_err(GatewayError::Registry)?;

        let children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        Ok(found
            .into_iter()
            .filter(|p| children.get(&p.pid).is_none_or(|r| r.exit.is_none()))
            .collect())
    }

    async fn start(&self, spec: &LaunchSpec) -> GatewayResult<ProcessInfo> {
        info!(
            "Starting {} {:?} on port {}",
            spec.binary,
            redact_args(&spec.args),
            spec.port
        );
        debug!("Gateway env keys: {:?}", spec.env.keys().collect::<Vec<_>>());

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProcessStartFailure::BinaryMissing(spec.binary.clone()),
            _ => ProcessStartFailure::Spawn(e.to_string()),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessStartFailure::Spawn("process exited before reporting a pid".to_string()))?;

        let output = Arc::new(Mutex::new(OutputBuffer::new(self.output_lines)));
        {
            let mut children = self.children.lock().unwrap_or_else(|p| p.into_inner());
            children.insert(
                pid,
                ChildRecord {
                    output: output.clone(),
                    exit: None,
                },
            );
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_output(stdout, pid, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_output(stderr, pid, output));
        }

        // Reap the child so it never lingers as a zombie.
        let registry = self.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => format_exit_status(status),
                Err(e) => {
                    warn!("Error waiting for gateway process {}: {:?}", pid, e);
                    "exited (unknown status)".to_string()
                }
            };
            warn!("Gateway process {} {}", pid, status);
            registry.record_exit(pid, status);
        });

        info!("Gateway spawned with PID {} on port {}", pid, spec.port);
        let mut command = vec![spec.binary.clone()];
        command.extend(redact_args(&spec.args));
        Ok(ProcessInfo {
            pid,
            command,
            started_at: Some(Utc::now()),
        })
    }

    async fn status(&self, pid: u32) -> ProcessStatus {
        if let Some(status) = self.known_exit(pid) {
            return ProcessStatus::Exited { status };
        }
        match proc_state(&self.proc_root, pid) {
            Some('Z') => ProcessStatus::Exited {
                status: "exited (zombie)".to_string(),
            },
            Some(_) => ProcessStatus::Running,
            None => ProcessStatus::Gone,
        }
    }

    async fn terminate(&self, pid: u32) {
        info!("Terminating process {}", pid);
        if let Err(e) = send_signal(pid, Signal::TERM) {
            debug!("SIGTERM to {} failed ({}); process may already be gone", pid, e);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.status(pid).await != ProcessStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
        if let Err(e) = send_signal(pid, Signal::KILL) {
            warn!("SIGKILL to {} failed: {}", pid, e);
        }
    }

    async fn port_holder(&self, port: u16) -> Option<String> {
        if port_is_free(port) {
            return None;
        }
        let root = self.proc_root.clone();
        let owner = tokio::task::spawn_blocking(move || {
            socket_owner(&root, &listening_inodes(&root, port))
        })
        .await
        .ok()
        .flatten();
        Some(
            owner
                .map(|(pid, name)| format!("{name} (pid {pid})"))
                .unwrap_or_else(|| "an unknown process".to_string()),
        )
    }

    async fn recent_output(&self, pid: u32) -> Vec<String> {
        let output = {
            let children = self.children.lock().unwrap_or_else(|p| p.into_inner());
            children.get(&pid).map(|r| r.output.clone())
        };
        match output {
            Some(buffer) => buffer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .tail(OUTPUT_TAIL),
            None => Vec::new(),
        }
    }
}

async fn capture_output<R>(reader: R, pid: u32, buffer: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[gateway {}] {}", pid, line);
        buffer.lock().unwrap_or_else(|p| p.into_inner()).push(line);
    }
}

/// Scan `/proc` for live processes matching `signature`.
fn scan_proc(root: &Path, signature: &CommandSignature) -> std::io::Result<Vec<ProcessInfo>> {
    let own_pid = std::process::id();
    let mut found = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        // Processes can exit between listing and reading.
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let argv = parse_cmdline(&raw);
        if argv.is_empty() || !signature.matches(&argv) {
            continue;
        }
        if matches!(proc_state(root, pid), Some('Z') | None) {
            continue;
        }
        found.push(ProcessInfo {
            pid,
            command: redact_args(&argv),
            started_at: None,
        });
    }

    found.sort_by_key(|p| p.pid);
    Ok(found)
}

/// Split a NUL-separated `/proc/<pid>/cmdline`.
fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

/// Process state letter from `/proc/<pid>/stat`.
fn proc_state(root: &Path, pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(root.join(pid.to_string()).join("stat")).ok()?;
    // The command name is parenthesised and may itself contain spaces.
    let after_name = stat.rsplit_once(')')?.1;
    after_name.trim_start().chars().next()
}

/// Describe how a child process ended.
pub fn format_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    match status.signal() {
        Some(signal) => match signal_name(signal) {
            Some(name) => format!("killed by signal {signal} ({name})"),
            None => format!("killed by signal {signal}"),
        },
        None => "exited (unknown status)".to_string(),
    }
}

fn signal_name(signal: i32) -> Option<&'static str> {
    Some(match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        15 => "SIGTERM",
        _ => return None,
    })
}

/// Send `signal` to `pid`. Errors (usually ESRCH) are returned to the caller.
fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .and_then(Pid::from_raw)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    Ok(kill_process(pid, signal)?)
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// TCP socket state code for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// Socket inodes listening on `port`, from `/proc/net/tcp{,6}`.
fn listening_inodes(root: &Path, port: u16) -> Vec<u64> {
    ["tcp", "tcp6"]
        .iter()
        .filter_map(|table| std::fs::read_to_string(root.join("net").join(table)).ok())
        .flat_map(|text| parse_tcp_listeners(&text, port))
        .collect()
}

// sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode
fn parse_tcp_listeners(text: &str, port: u16) -> Vec<u64> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local_port = fields.get(1)?.rsplit_once(':')?.1;
            let local_port = u16::from_str_radix(local_port, 16).ok()?;
            if local_port != port || *fields.get(3)? != TCP_LISTEN {
                return None;
            }
            fields.get(9)?.parse::<u64>().ok()
        })
        .filter(|inode| *inode != 0)
        .collect()
}

/// Process holding one of `inodes` open, as `(pid, comm)`.
fn socket_owner(root: &Path, inodes: &[u64]) -> Option<(u32, String)> {
    let wanted: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

    for entry in std::fs::read_dir(root).ok()?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // fd listings of other users' processes are not readable.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .is_ok_and(|target| wanted.iter().any(|w| target.as_os_str() == w.as_str()))
        });
        if holds {
            let name = std::fs::read_to_string(entry.path().join("comm"))
                .map(|c| c.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            return Some((pid, name));
        }
    }
    None
}
