//! # Tracemill Core
//!
//! Execution engine for running scanners over recorded agent conversation
//! transcripts, with durable exactly-once result recording.
//!
//! ## Overview
//!
//! A scan run is declared as a [`tracemill_model::ScanSpec`]: a set of
//! scanners crossed with a transcript corpus. The engine plans the
//! not-yet-recorded work lazily, executes it concurrently within configured
//! limits, and records results idempotently into per-scanner durable tables,
//! so an interrupted run resumes from exactly the uncovered remainder.
//!
//! ## Architecture
//!
//! - [`planner`]: lazy, resumable work enumeration (live, worklist, dry-run)
//! - [`scheduler`]: concurrent execution, segment reassembly, backpressure,
//!   hang detection and cancellation
//! - [`recorder`]: staged, idempotent recording with atomic table flushes
//! - [`registry`]: cross-process registry of live scans
//! - [`archive`]: cached archive directory parsing and member streaming
//! - [`source`]: transcript corpus access behind the [`source::TranscriptSource`] trait
//! - [`run`]: end-to-end orchestration via [`run::ScanEngine`]

pub mod archive;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics_probe;
pub mod planner;
pub mod recorder;
pub mod registry;
pub mod run;
pub mod scheduler;
pub mod source;

pub use archive::{ArchiveDirectoryCache, ArchiveTranscriptSource, ByteReader};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use recorder::RecorderBuffer;
pub use registry::ActiveScanRegistry;
pub use run::{ScanEngine, complete, run_status};
pub use scheduler::{ExecutionReport, ExecutionScheduler};
pub use source::{
    ContentFilter, FsTranscriptSource, Scanner, TranscriptContent, TranscriptSource,
};
