//! Durable state: restore at startup, periodic push afterwards.
//!
//! Freshness is tracked with an explicit completion marker, never with file
//! modification times.

mod error;
mod marker;
mod restore;
mod sync;
mod transfer;

use std::sync::Arc;

pub use error::{
    RestoreError, RestoreResult, SyncError, SyncResult, TransferError, TransferResult,
};
pub use marker::{MarkerState, SyncMarker, read_marker, write_marker};
pub use restore::{Freshness, RestoreAction, RestoreDecision, RestorePolicy, RestoreReport};
pub use sync::{
    SkipReason, SyncEngine, SyncLease, SyncOutcome, SyncRun, SyncSettings, SyncSnapshot,
    SyncTrigger,
};
pub use transfer::{BuiltinTransfer, FileTransfer, RsyncTransfer, TransferBackend, TransferReport};

use crate::config::SyncConfig;

/// Build the configured transfer backend.
pub fn transfer_from_config(config: &SyncConfig) -> TransferResult<Arc<dyn FileTransfer>> {
    let exclude = config.transfer_excludes();
    Ok(match config.backend {
        TransferBackend::Rsync => Arc::new(RsyncTransfer::new(
            config.rsync_binary.clone(),
            config.checksum,
            exclude,
            config.transfer_timeout(),
        )),
        TransferBackend::Builtin => Arc::new(BuiltinTransfer::new(&exclude)?),
    })
}
