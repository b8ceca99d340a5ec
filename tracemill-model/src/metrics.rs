use serde::{Deserialize, Serialize};

/// Lifecycle state of one cooperative scan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Parsing,
    Scanning,
}

/// Point-in-time counters for one running scan, sampled on a throttled
/// interval and pushed to the active-scan registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanMetrics {
    /// Worker groups currently alive.
    pub processes: usize,
    /// Cooperative tasks across all worker groups.
    pub tasks: usize,
    pub idle: usize,
    pub parsing: usize,
    pub scanning: usize,
    /// Units queued for dispatch plus results buffered awaiting flush.
    pub queued: usize,
    pub buffered: usize,
    pub completed: usize,
    /// Resident set size of this process in bytes.
    pub memory_bytes: u64,
    /// Batching scanners: transcripts held back for one underlying call.
    pub batch_pending: usize,
    /// Age of the oldest batch-pending transcript, in seconds.
    pub oldest_pending_secs: u64,
}
