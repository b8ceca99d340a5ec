use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::{ScannerDescriptor, SourceDescriptor};

/// Terminal status of a run.
///
/// A run finishing with per-unit errors is still `Complete`; a run stopped
/// before covering all planned units is `Interrupted` and resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Interrupted,
}

/// Per-scanner scan/result/error counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerCounts {
    pub scans: usize,
    pub results: usize,
    pub errors: usize,
}

/// Run-level summary persisted next to the durable tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub scanners: BTreeMap<String, ScannerCounts>,
    /// Durable location this summary describes; doubles as the resume pointer
    /// when `status` is `Interrupted`.
    pub location: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn empty(location: PathBuf) -> Self {
        Self {
            status: RunStatus::Complete,
            scanners: BTreeMap::new(),
            location,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        }
    }

    pub fn total_errors(&self) -> usize {
        self.scanners.values().map(|c| c.errors).sum()
    }
}

/// Durable description of what produced a result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub scanners: Vec<ScannerDescriptor>,
    pub source: SourceDescriptor,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
