//! Error types for transfers, restore and sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::failure::{Classified, FailureCategory};

pub type TransferResult<T> = Result<T, TransferError>;
pub type RestoreResult<T> = Result<T, RestoreError>;
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors from a single file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer binary not found: {0}")]
    BinaryMissing(String),

    #[error("transfer source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("transfer command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("transfer timed out after {0:?}")]
    TimedOut(Duration),

    #[error("invalid exclude pattern '{0}'")]
    InvalidPattern(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    fn summary(&self) -> String {
        match self {
            TransferError::BinaryMissing(bin) => format!("transfer tool not installed ({bin})"),
            TransferError::SourceMissing(p) => format!("source {} missing", p.display()),
            TransferError::CommandFailed { status, .. } => {
                format!("transfer command failed ({status})")
            }
            TransferError::TimedOut(d) => format!("transfer timed out after {}s", d.as_secs()),
            TransferError::InvalidPattern(p) => format!("invalid exclude pattern '{p}'"),
            TransferError::Io(e) => format!("io error ({:?})", e.kind()),
        }
    }
}

/// Errors while restoring remote state to local.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("local and remote state paths overlap: {local} / {remote}")]
    OverlappingPaths { local: PathBuf, remote: PathBuf },

    #[error("restore copy failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("writing local sync marker failed: {0}")]
    Marker(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classified for RestoreError {
    fn category(&self) -> FailureCategory {
        FailureCategory::Restore
    }

    fn summary(&self) -> String {
        match self {
            RestoreError::OverlappingPaths { .. } => "state paths overlap".to_string(),
            RestoreError::Transfer(e) => format!("restore copy failed: {}", e.summary()),
            RestoreError::Marker(e) => format!("local marker write failed ({:?})", e.kind()),
            RestoreError::Io(e) => format!("io error ({:?})", e.kind()),
        }
    }
}

/// Errors that end a sync run as failed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local state directory missing: {0}")]
    SourceMissing(PathBuf),

    #[error("local state incomplete, missing {0}")]
    SourceIncomplete(PathBuf),

    #[error("local and remote state paths overlap: {local} / {remote}")]
    OverlappingPaths { local: PathBuf, remote: PathBuf },

    #[error("sync transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("writing sync marker failed: {0}")]
    Marker(#[source] std::io::Error),
}

impl Classified for SyncError {
    fn category(&self) -> FailureCategory {
        FailureCategory::Sync
    }

    fn summary(&self) -> String {
        match self {
            SyncError::SourceMissing(_) => "local state missing".to_string(),
            SyncError::SourceIncomplete(p) => format!(
                "local state incomplete ({})",
                p.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            ),
            SyncError::OverlappingPaths { .. } => "state paths overlap".to_string(),
            SyncError::Transfer(e) => format!("sync transfer failed: {}", e.summary()),
            SyncError::Marker(e) => format!("marker write failed ({:?})", e.kind()),
        }
    }
}
