//! Sync completion marker.
//!
//! The mounted bucket does not preserve modification times, so freshness is
//! tracked with an explicit marker written after every successful sync.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Record of the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    /// Monotonic sync counter; higher is newer.
    pub epoch: u64,
    pub completed_at: DateTime<Utc>,
    /// Entries transferred by the sync that wrote this marker.
    #[serde(default)]
    pub entries: u64,
}

impl SyncMarker {
    /// Marker for the sync following `previous` epochs.
    pub fn next(previous: &[MarkerState], entries: u64) -> Self {
        let epoch = previous.iter().filter_map(MarkerState::epoch).max().unwrap_or(0) + 1;
        Self {
            epoch,
            completed_at: Utc::now(),
            entries,
        }
    }
}

/// Result of reading a marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Missing,
    Present(SyncMarker),
    /// The file exists but could not be parsed.
    Unreadable,
}

impl MarkerState {
    pub fn epoch(&self) -> Option<u64> {
        match self {
            MarkerState::Present(m) => Some(m.epoch),
            _ => None,
        }
    }

    pub fn marker(&self) -> Option<&SyncMarker> {
        match self {
            MarkerState::Present(m) => Some(m),
            _ => None,
        }
    }
}

/// Read the marker named `file` in `dir`.
pub async fn read_marker(dir: &Path, file: &str) -> MarkerState {
    let path = dir.join(file);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MarkerState::Missing,
        Err(e) => {
            warn!("Reading sync marker {} failed: {}", path.display(), e);
            return MarkerState::Unreadable;
        }
    };

    match serde_json::from_slice::<SyncMarker>(&bytes) {
        Ok(marker) => MarkerState::Present(marker),
        Err(e) => {
            warn!("Sync marker {} is not valid: {}", path.display(), e);
            MarkerState::Unreadable
        }
    }
}

/// Write the marker via a temporary file and rename.
pub async fn write_marker(dir: &Path, file: &str, marker: &SyncMarker) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(marker).map_err(std::io::Error::other)?;
    let tmp = dir.join(format!("{file}.tmp"));
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, dir.join(file)).await
}
