//! Restore policy.
//!
//! Runs once per container, after the bucket is mounted and before the
//! gateway starts. Decides whether remote state should replace local state
//! and, if so, copies remote -> local. It never writes to the remote side.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{RestoreError, RestoreResult};
use super::marker::{MarkerState, read_marker, write_marker};
use super::transfer::FileTransfer;
use crate::failure::Classified;
use crate::storage::is_empty_dir;

/// What the restore policy decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreAction {
    Restore,
    Skip,
}

/// Why the restore policy decided what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Remote storage is not mounted; nothing to compare.
    StorageUnavailable,
    /// No remote state yet (first run).
    NoRemoteState,
    /// Remote marker epoch is newer than the local one.
    RemoteNewer,
    /// Remote has a marker, local has none (or local state is absent).
    LocalMissing,
    /// Remote has data but no usable marker; restore to be safe.
    NoMarkerFallback,
    /// Local marker is at least as new as the remote one.
    LocalCurrent,
    /// Markers or directories could not be read; nothing was compared.
    DecisionFailed,
}

/// One-time startup decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreDecision {
    pub remote_exists: bool,
    pub freshness: Freshness,
    pub action: RestoreAction,
    pub remote_epoch: Option<u64>,
    pub local_epoch: Option<u64>,
    pub decided_at: DateTime<Utc>,
    /// Files copied when the action was carried out.
    pub restored_entries: Option<u64>,
    /// Classified failure when the copy did not complete.
    pub error: Option<String>,
}

impl RestoreDecision {
    fn new(
        remote_exists: bool,
        freshness: Freshness,
        remote_epoch: Option<u64>,
        local_epoch: Option<u64>,
    ) -> Self {
        let action = match freshness {
            Freshness::RemoteNewer | Freshness::LocalMissing | Freshness::NoMarkerFallback => {
                RestoreAction::Restore
            }
            Freshness::StorageUnavailable
            | Freshness::NoRemoteState
            | Freshness::LocalCurrent
            | Freshness::DecisionFailed => RestoreAction::Skip,
        };
        Self {
            remote_exists,
            freshness,
            action,
            remote_epoch,
            local_epoch,
            decided_at: Utc::now(),
            restored_entries: None,
            error: None,
        }
    }

    /// Decision used when the bucket could not be mounted.
    pub fn storage_unavailable() -> Self {
        Self::new(false, Freshness::StorageUnavailable, None, None)
    }
}

/// Decision plus the copy error, if the copy was attempted and failed.
#[derive(Debug)]
pub struct RestoreReport {
    pub decision: RestoreDecision,
    pub error: Option<RestoreError>,
}

/// Compares marker epochs and pulls remote state down when it is newer.
pub struct RestorePolicy {
    marker_file: String,
    transfer: Arc<dyn FileTransfer>,
}

impl RestorePolicy {
    pub fn new(marker_file: impl Into<String>, transfer: Arc<dyn FileTransfer>) -> Self {
        Self {
            marker_file: marker_file.into(),
            transfer,
        }
    }

    /// Compute the decision without copying anything.
    pub async fn decide(&self, local: &Path, remote: &Path) -> RestoreResult<RestoreDecision> {
        check_disjoint(local, remote)?;

        let remote_marker = read_marker(remote, &self.marker_file).await;
        let remote_has_data = !is_empty_dir(remote)?;
        let remote_exists = remote_has_data || remote_marker != MarkerState::Missing;

        let local_marker = read_marker(local, &self.marker_file).await;
        let local_absent = is_empty_dir(local)?;

        let remote_epoch = remote_marker.epoch();
        let local_epoch = local_marker.epoch();

        let freshness = if !remote_exists {
            Freshness::NoRemoteState
        } else {
            match (remote_epoch, local_epoch) {
                (None, _) => Freshness::NoMarkerFallback,
                (Some(_), _) if local_absent => Freshness::LocalMissing,
                (Some(_), None) => Freshness::LocalMissing,
                (Some(r), Some(l)) if r > l => Freshness::RemoteNewer,
                (Some(_), Some(_)) => Freshness::LocalCurrent,
            }
        };

        Ok(RestoreDecision::new(
            remote_exists,
            freshness,
            remote_epoch,
            local_epoch,
        ))
    }

    /// Decide, and copy remote -> local when the decision says so.
    ///
    /// Failures are reported, not raised: startup continues with whatever
    /// local state exists.
    pub async fn decide_and_restore(&self, local: &Path, remote: &Path) -> RestoreReport {
        let mut decision = match self.decide(local, remote).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Restore decision failed: {}", e.summary());
                let mut decision = RestoreDecision::new(false, Freshness::DecisionFailed, None, None);
                decision.error = Some(e.summary());
                return RestoreReport {
                    decision,
                    error: Some(e),
                };
            }
        };

        info!(
            "Restore decision: {:?} ({:?}, remote epoch {:?}, local epoch {:?})",
            decision.action, decision.freshness, decision.remote_epoch, decision.local_epoch
        );

        if decision.action == RestoreAction::Skip {
            return RestoreReport {
                decision,
                error: None,
            };
        }

        match self.copy_down(local, remote).await {
            Ok(entries) => {
                info!(
                    "Restored {} file(s) from {} to {}",
                    entries,
                    remote.display(),
                    local.display()
                );
                decision.restored_entries = Some(entries);
                RestoreReport {
                    decision,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Restore from {} failed: {}", remote.display(), e.summary());
                decision.error = Some(e.summary());
                RestoreReport {
                    decision,
                    error: Some(e),
                }
            }
        }
    }

    async fn copy_down(&self, local: &Path, remote: &Path) -> RestoreResult<u64> {
        tokio::fs::create_dir_all(local).await?;
        let report = self.transfer.transfer(remote, local).await?;

        // The marker is excluded from transfers; mirror it explicitly so the
        // local epoch matches what was restored.
        if let MarkerState::Present(marker) = read_marker(remote, &self.marker_file).await {
            write_marker(local, &self.marker_file, &marker)
                .await
                .map_err(RestoreError::Marker)?;
        }
        Ok(report.entries)
    }
}

fn check_disjoint(local: &Path, remote: &Path) -> RestoreResult<()> {
    if local.starts_with(remote) || remote.starts_with(local) {
        return Err(RestoreError::OverlappingPaths {
            local: PathBuf::from(local),
            remote: PathBuf::from(remote),
        });
    }
    Ok(())
}
