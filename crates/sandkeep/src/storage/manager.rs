//! Mount manager.
//!
//! Attaches the remote bucket at a fixed path exactly once. Callers may invoke
//! [`MountManager::ensure_mounted`] as often as they like; attempts are
//! serialized and skipped when the mount table already lists the path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::error::{MountError, MountResult};
use super::mounter::{BucketMounter, MountRequest, is_empty_dir};
use super::table::MountTable;
use crate::failure::Classified;

/// Mount state of the remote bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Unmounted,
    Mounting,
    Mounted,
    MountFailed,
}

/// Point-in-time view of the remote mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSnapshot {
    pub path: PathBuf,
    pub status: MountStatus,
    /// True when the path is a real mount point, false when it is just a
    /// local directory (possibly empty).
    pub backed_by_mount: bool,
    /// Number of mount commands actually issued.
    pub attempts: u64,
    pub last_error: Option<String>,
}

/// Ensures the bucket is mounted at its configured path.
pub struct MountManager {
    request: MountRequest,
    mounter: Arc<dyn BucketMounter>,
    table: Arc<dyn MountTable>,
    lock: Mutex<()>,
    last_error: std::sync::Mutex<Option<String>>,
    status_tx: watch::Sender<MountStatus>,
    attempts: AtomicU64,
}

impl std::fmt::Debug for MountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountManager")
            .field("request", &self.request)
            .field("status", &*self.status_tx.borrow())
            .finish()
    }
}

impl MountManager {
    pub fn new(
        request: MountRequest,
        mounter: Arc<dyn BucketMounter>,
        table: Arc<dyn MountTable>,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(MountStatus::Unmounted);
        Self {
            request,
            mounter,
            table,
            lock: Mutex::new(()),
            last_error: std::sync::Mutex::new(None),
            status_tx,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn mount_path(&self) -> &Path {
        &self.request.mount_path
    }

    pub fn status(&self) -> MountStatus {
        *self.status_tx.borrow()
    }

    /// Receive mount status changes.
    pub fn subscribe(&self) -> watch::Receiver<MountStatus> {
        self.status_tx.subscribe()
    }

    /// Number of mount commands issued so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Mount the bucket unless the mount table already lists it.
    ///
    /// Returns the local mount path. Performs at most one mount attempt per
    /// call and never removes or truncates an existing mount point.
    pub async fn ensure_mounted(&self) -> MountResult<PathBuf> {
        let _guard = self.lock.lock().await;
        let path = self.request.mount_path.clone();

        if self.table.is_mount_point(&path)? {
            debug!("{} already mounted", path.display());
            self.status_tx.send_replace(MountStatus::Mounted);
            self.set_last_error(None);
            return Ok(path);
        }

        let result = self.mount_once(&path).await;
        match result {
            Ok(()) => {
                info!("Bucket {} mounted at {}", self.request.bucket, path.display());
                self.status_tx.send_replace(MountStatus::Mounted);
                self.set_last_error(None);
                Ok(path)
            }
            Err(e) => {
                warn!("Mounting {} failed: {}", path.display(), e.summary());
                debug!("mount error detail: {}", e);
                self.status_tx.send_replace(MountStatus::MountFailed);
                self.set_last_error(Some(e.summary()));
                Err(e)
            }
        }
    }

    async fn mount_once(&self, path: &Path) -> MountResult<()> {
        prepare_mount_point(path)?;

        self.status_tx.send_replace(MountStatus::Mounting);
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.mounter.mount(&self.request).await?;

        // Trust the mount table, not the tool's exit status.
        if self.table.is_mount_point(path)? {
            Ok(())
        } else {
            Err(MountError::NotMountedAfterAttempt(path.to_path_buf()))
        }
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    /// Check a `Mounted` status against the mount table.
    ///
    /// A mount that has dropped out of the table is published as
    /// [`MountStatus::Unmounted`]. Other states are returned as they are.
    pub fn verify(&self) -> MountStatus {
        let status = self.status();
        if status != MountStatus::Mounted {
            return status;
        }

        let path = &self.request.mount_path;
        let lost = match self.table.is_mount_point(path) {
            Ok(true) => return MountStatus::Mounted,
            Ok(false) => "mount disappeared".to_string(),
            Err(e) => format!("mount table unreadable ({:?})", e.kind()),
        };
        warn!("{} is no longer mounted: {}", path.display(), lost);
        self.status_tx.send_replace(MountStatus::Unmounted);
        self.set_last_error(Some(lost));
        MountStatus::Unmounted
    }

    /// Current mount view. Does not wait for an in-flight mount attempt.
    pub async fn snapshot(&self) -> MountSnapshot {
        let status = self.verify();
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let path = self.request.mount_path.clone();
        let backed_by_mount = self.table.is_mount_point(&path).unwrap_or(false);
        MountSnapshot {
            path,
            status,
            backed_by_mount,
            attempts: self.attempts(),
            last_error,
        }
    }
}

/// Create the mount point if it is missing. Existing directories are left
/// untouched, even if non-empty.
fn prepare_mount_point(path: &Path) -> MountResult<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            if !is_empty_dir(path)? {
                warn!(
                    "Mount point {} is a non-empty local directory; mounting over it",
                    path.display()
                );
            }
            Ok(())
        }
        Ok(_) => Err(MountError::MountPointNotDirectory(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
