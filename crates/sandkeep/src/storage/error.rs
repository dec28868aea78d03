//! Mount error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::failure::{Classified, FailureCategory};

/// Result type for mount operations.
pub type MountResult<T> = Result<T, MountError>;

/// Errors that can occur while attaching the remote bucket.
#[derive(Debug, Error)]
pub enum MountError {
    /// A credential variable is not set.
    #[error("storage credentials missing: {0} is not set")]
    CredentialsMissing(String),

    /// The mount tool is not installed.
    #[error("mount binary not found: {0}")]
    BinaryMissing(String),

    /// Mounting needs root.
    #[error("mounting requires root privileges")]
    InsufficientPrivileges,

    /// The mount tool exited with an error.
    #[error("mount command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    /// The mount tool did not finish in time.
    #[error("mount command timed out after {0:?}")]
    TimedOut(Duration),

    /// The tool reported success but the mount table disagrees.
    #[error("mount reported success but {0} is not in the mount table")]
    NotMountedAfterAttempt(PathBuf),

    /// Something other than a directory sits at the mount point.
    #[error("mount point {0} exists and is not a directory")]
    MountPointNotDirectory(PathBuf),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classified for MountError {
    fn category(&self) -> FailureCategory {
        FailureCategory::Mount
    }

    fn summary(&self) -> String {
        match self {
            MountError::CredentialsMissing(var) => format!("credentials missing ({var})"),
            MountError::BinaryMissing(bin) => format!("mount tool not installed ({bin})"),
            MountError::InsufficientPrivileges => "mount requires root".to_string(),
            MountError::CommandFailed { status, .. } => {
                format!("mount command failed ({status})")
            }
            MountError::TimedOut(d) => format!("mount timed out after {}s", d.as_secs()),
            MountError::NotMountedAfterAttempt(_) => {
                "bucket not in mount table after mount".to_string()
            }
            MountError::MountPointNotDirectory(p) => {
                format!("mount point {} is not a directory", p.display())
            }
            MountError::Io(e) => format!("io error ({:?})", e.kind()),
        }
    }
}
