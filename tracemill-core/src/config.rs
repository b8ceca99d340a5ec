use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the scan execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the shared dispatch queue.
    pub queue_depth: usize,
    /// Maximum buffered (recorded but unflushed) rows before dispatch pauses.
    pub max_buffered_results: usize,
    /// Interval between recorder flushes.
    pub flush_interval: Duration,
    /// Flush is forced once the oldest batch-pending transcript is older
    /// than this, regardless of buffer fill.
    pub batch_pending_timeout: Duration,
    /// Interval between metrics samples pushed to the registry.
    pub metrics_interval: Duration,
    /// A task with no state transition for this long is reported as hung.
    pub hang_deadline: Duration,
    /// Grace period granted to in-flight units on interrupt.
    pub shutdown_grace: Duration,
    /// Location of the cross-process active-scan registry.
    pub registry_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            max_buffered_results: 4096,
            flush_interval: Duration::from_secs(30),
            batch_pending_timeout: Duration::from_secs(120),
            metrics_interval: Duration::from_secs(2),
            hang_deadline: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            registry_path: default_registry_path(),
        }
    }
}

/// Default registry location, shared by every process on the host.
pub fn default_registry_path() -> PathBuf {
    std::env::temp_dir().join("tracemill-registry")
}
