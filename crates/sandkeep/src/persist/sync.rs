//! Sync engine.
//!
//! Pushes the local state directory to the mounted remote path. At most one
//! run is active at a time; a run that finds another in progress is skipped,
//! never queued. Failures end the run and are recorded, never raised.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{SyncError, SyncResult};
use super::marker::{SyncMarker, read_marker, write_marker};
use super::transfer::FileTransfer;
use crate::config::AppConfig;
use crate::failure::{Classified, FailureLedger};
use crate::storage::{MountManager, MountStatus};

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Periodic,
    Manual,
    Shutdown,
}

/// Why a run did not transfer anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Another run held the lease.
    ConcurrentRun,
    /// The startup restore decision has not been made yet.
    RestorePending,
    /// The remote bucket is not mounted.
    StorageUnavailable,
    /// The startup restore did not complete; local state may be stale.
    RestoreFailed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::ConcurrentRun => "skipped-due-to-concurrent-run",
            SkipReason::RestorePending => "restore-pending",
            SkipReason::StorageUnavailable => "storage-unavailable",
            SkipReason::RestoreFailed => "restore-failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Success { entries: u64, epoch: u64 },
    Failed { error: String },
    Skipped { reason: SkipReason },
}

/// One execution of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: u64,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: SyncOutcome,
}

impl SyncRun {
    pub fn entries(&self) -> u64 {
        match self.outcome {
            SyncOutcome::Success { entries, .. } => entries,
            _ => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Success { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.outcome {
            SyncOutcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Exclusive right to run a sync. Released when dropped, including when the
/// owning future is abandoned mid-transfer.
#[derive(Debug)]
pub struct SyncLease<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SyncLease<'a> {
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SyncLease<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Paths and checks for a sync run.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub local_dir: PathBuf,
    pub remote_dir: PathBuf,
    pub marker_file: String,
    pub required_files: Vec<String>,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            local_dir: config.local_state_dir(),
            remote_dir: config.remote_state_dir(),
            marker_file: config.sync.marker_file.clone(),
            required_files: config.sync.required_files.clone(),
        }
    }
}

/// Counters and recent runs, for status queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub active: bool,
    pub armed: bool,
    /// Pushes are held because the startup restore failed.
    pub restore_failed: bool,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_run: Option<SyncRun>,
    pub last_success: Option<SyncRun>,
}

pub struct SyncEngine {
    settings: SyncSettings,
    transfer: Arc<dyn FileTransfer>,
    mount: Arc<MountManager>,
    ledger: Arc<FailureLedger>,
    armed: AtomicBool,
    restore_failed: AtomicBool,
    active: AtomicBool,
    next_id: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    last_run: RwLock<Option<SyncRun>>,
    last_success: RwLock<Option<SyncRun>>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        transfer: Arc<dyn FileTransfer>,
        mount: Arc<MountManager>,
        ledger: Arc<FailureLedger>,
    ) -> Self {
        Self {
            settings,
            transfer,
            mount,
            ledger,
            armed: AtomicBool::new(false),
            restore_failed: AtomicBool::new(false),
            active: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_run: RwLock::new(None),
            last_success: RwLock::new(None),
        }
    }

    /// Allow pushes. Called once the startup restore decision exists.
    pub fn arm(&self) {
        if !self.armed.swap(true, Ordering::AcqRel) {
            debug!("Sync engine armed");
        }
    }

    /// Refuse pushes for the rest of this container's life.
    ///
    /// Used when the restore decision said remote state is needed but the
    /// copy did not finish, or when no decision could be made at all.
    pub fn hold_for_failed_restore(&self) {
        if !self.restore_failed.swap(true, Ordering::AcqRel) {
            warn!("Sync held: startup restore did not complete");
        }
    }

    pub fn is_held(&self) -> bool {
        self.restore_failed.load(Ordering::Acquire)
    }

    /// Armed and not held.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire) && !self.is_held()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run one sync. Never fails; the outcome is in the returned run.
    pub async fn run_sync(&self, trigger: SyncTrigger) -> SyncRun {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Utc::now();

        let outcome = match self.gate() {
            Some(reason) => SyncOutcome::Skipped { reason },
            None => match SyncLease::try_acquire(&self.active) {
                None => SyncOutcome::Skipped {
                    reason: SkipReason::ConcurrentRun,
                },
                Some(_lease) => {
                    info!("Sync #{} ({:?}) started", id, trigger);
                    match self.push().await {
                        Ok((entries, epoch)) => SyncOutcome::Success { entries, epoch },
                        Err(e) => {
                            self.ledger.record(&e);
                            debug!("sync #{} error detail: {}", id, e);
                            SyncOutcome::Failed { error: e.summary() }
                        }
                    }
                }
            },
        };

        let run = SyncRun {
            id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            outcome,
        };
        self.finish(&run);
        run
    }

    fn gate(&self) -> Option<SkipReason> {
        if self.is_held() {
            return Some(SkipReason::RestoreFailed);
        }
        if !self.is_armed() {
            return Some(SkipReason::RestorePending);
        }
        if self.mount.verify() != MountStatus::Mounted {
            return Some(SkipReason::StorageUnavailable);
        }
        None
    }

    async fn push(&self) -> SyncResult<(u64, u64)> {
        let SyncSettings {
            local_dir,
            remote_dir,
            marker_file,
            required_files,
        } = &self.settings;

        check_source(local_dir, remote_dir, required_files)?;

        let report = self.transfer.transfer(local_dir, remote_dir).await?;

        let previous = [
            read_marker(remote_dir, marker_file).await,
            read_marker(local_dir, marker_file).await,
        ];
        let marker = SyncMarker::next(&previous, report.entries);
        write_marker(remote_dir, marker_file, &marker)
            .await
            .map_err(SyncError::Marker)?;
        write_marker(local_dir, marker_file, &marker)
            .await
            .map_err(SyncError::Marker)?;

        Ok((report.entries, marker.epoch))
    }

    fn finish(&self, run: &SyncRun) {
        match &run.outcome {
            SyncOutcome::Success { entries, epoch } => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Sync #{} finished: {} file(s), epoch {}",
                    run.id, entries, epoch
                );
                *self.last_success.write().unwrap_or_else(|p| p.into_inner()) = Some(run.clone());
            }
            SyncOutcome::Failed { error } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Sync #{} failed: {}", run.id, error);
            }
            SyncOutcome::Skipped { reason } => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                info!("Sync #{} ({:?}) skipped: {}", run.id, run.trigger, reason);
            }
        }
        *self.last_run.write().unwrap_or_else(|p| p.into_inner()) = Some(run.clone());
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            active: self.is_active(),
            armed: self.is_armed(),
            restore_failed: self.is_held(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_run: self
                .last_run
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            last_success: self
                .last_success
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }

    /// Run a periodic sync every `period` until `cancel` fires.
    ///
    /// The first run happens one full period after the call.
    pub async fn run_periodic(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Periodic sync every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Periodic sync stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_sync(SyncTrigger::Periodic).await;
                }
            }
        }
    }
}

/// Refuse to push a missing or half-initialised state directory.
fn check_source(local: &Path, remote: &Path, required_files: &[String]) -> SyncResult<()> {
    if local.starts_with(remote) || remote.starts_with(local) {
        return Err(SyncError::OverlappingPaths {
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
        });
    }
    if !local.is_dir() {
        return Err(SyncError::SourceMissing(local.to_path_buf()));
    }
    if let Some(missing) = required_files
        .iter()
        .map(|f| local.join(f))
        .find(|p| !p.exists())
    {
        return Err(SyncError::SourceIncomplete(missing));
    }
    Ok(())
}
