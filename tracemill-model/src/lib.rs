//! Core data model definitions shared across Tracemill crates.

pub mod metrics;
pub mod record;
pub mod registry;
pub mod spec;
pub mod summary;

pub use metrics::{ScanMetrics, TaskState};
pub use record::{LabelledValue, RecordError, ResultRecord};
pub use registry::ActiveScanInfo;
pub use spec::{
    ConcurrencyLimits, ScanSpec, ScannerDescriptor, Segment, SourceDescriptor,
    TranscriptRef, WorkUnit, Worklist, WorklistEntry,
};
pub use summary::{RunManifest, RunStatus, RunSummary, ScannerCounts};
