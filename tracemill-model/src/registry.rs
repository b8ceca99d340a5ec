use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::ScanMetrics;

/// Shared, cross-process view of one running (or recently finished) scan.
///
/// Created at scan start, refreshed on every metrics tick, marked terminal at
/// run end. Entries persist in the registry after their owning process exits,
/// until a store-level version bump wipes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveScanInfo {
    pub scan_id: Uuid,
    pub metrics: ScanMetrics,
    /// Short human-readable description of the spec (scanners, source).
    pub summary: String,
    /// Durable output location of the run.
    pub location: String,
    /// Total planned units for the run.
    pub total_scans: usize,
    pub start_time: DateTime<Utc>,
    /// Monotonically non-decreasing until the entry turns terminal.
    pub last_updated: DateTime<Utc>,
    pub running: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ActiveScanInfo {
    pub fn new(
        scan_id: Uuid,
        summary: impl Into<String>,
        location: impl Into<String>,
        total_scans: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            scan_id,
            metrics: ScanMetrics::default(),
            summary: summary.into(),
            location: location.into(),
            total_scans,
            start_time: now,
            last_updated: now,
            running: true,
            error_message: None,
        }
    }
}
