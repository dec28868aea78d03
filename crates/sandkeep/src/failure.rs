//! Failure ledger.
//!
//! Keeps the most recent failure per category so status queries can report
//! what went wrong without exposing raw tool output.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Mount,
    Restore,
    Sync,
    ProcessStart,
    Readiness,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCategory::Mount => "mount",
            FailureCategory::Restore => "restore",
            FailureCategory::Sync => "sync",
            FailureCategory::ProcessStart => "process_start",
            FailureCategory::Readiness => "readiness",
        };
        f.write_str(name)
    }
}

/// A classified failure, safe to show on a status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// Implemented by error types that can be recorded in the ledger.
pub trait Classified {
    fn category(&self) -> FailureCategory;

    /// Short description without tool stderr or secrets.
    fn summary(&self) -> String;
}

/// Most recent failure per category.
#[derive(Debug, Default)]
pub struct FailureLedger {
    entries: Mutex<HashMap<FailureCategory, FailureRecord>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, replacing any earlier one in the same category.
    pub fn record(&self, err: &dyn Classified) -> FailureRecord {
        let record = FailureRecord {
            category: err.category(),
            summary: err.summary(),
            at: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(record.category, record.clone());
        record
    }

    pub fn latest(&self, category: FailureCategory) -> Option<FailureRecord> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(&category).cloned()
    }

    /// All recorded failures, ordered by category.
    pub fn snapshot(&self) -> Vec<FailureRecord> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut records: Vec<FailureRecord> = entries.values().cloned().collect();
        records.sort_by_key(|r| r.category);
        records
    }
}
