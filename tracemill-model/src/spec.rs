use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Immutable declaration of one scan run: which scanners run over which
/// transcript corpus, under which limits, writing where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSpec {
    pub scanners: Vec<ScannerDescriptor>,
    pub source: SourceDescriptor,
    pub limits: ConcurrencyLimits,
    /// Durable output location for tables, summary and manifest.
    pub output: PathBuf,
}

/// Explicit registry entry for one scanner. The engine only ever sees the
/// descriptor plus an invocation capability; scanner business logic lives
/// behind the `Scanner` trait in the core crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerDescriptor {
    /// Logical scanner name; also the durable table key.
    pub name: String,
    /// Free-form scanner parameters, validated by the scanner itself.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl ScannerDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }
}

/// Where transcripts come from. The engine treats this as opaque apart from
/// `kind`; the configured transcript source interprets `location`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Source kind, e.g. "fs" or "archive".
    pub kind: String,
    /// Local path or remote URL understood by the source implementation.
    pub location: String,
}

/// Concurrency limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Number of worker groups (the fault-isolation unit).
    pub workers: usize,
    /// Cooperative tasks per worker group.
    pub tasks_per_worker: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            workers: 2,
            tasks_per_worker: 8,
        }
    }
}

/// Reference to one transcript, sufficient to fetch its content later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranscriptRef {
    /// Stable transcript identifier, unique within the source.
    pub id: String,
    /// Archive member name when the transcript lives inside an archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

impl TranscriptRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            member: None,
        }
    }

    pub fn in_archive(id: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            member: Some(member.into()),
        }
    }
}

/// One independently dispatched sub-portion of a transcript. Segment results
/// are reassembled in `index` order before recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub count: usize,
}

/// One (scanner, transcript) pair awaiting execution. The key
/// `(scanner, transcript.id)` is unique within a spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub scanner: String,
    pub transcript: TranscriptRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<Segment>,
}

impl WorkUnit {
    pub fn new(scanner: impl Into<String>, transcript: TranscriptRef) -> Self {
        Self {
            scanner: scanner.into(),
            transcript,
            segment: None,
        }
    }

    /// Logical idempotency key for this unit.
    pub fn key(&self) -> (&str, &str) {
        (&self.scanner, &self.transcript.id)
    }
}

/// Explicit worklist loaded from a structured file, bypassing live
/// enumeration for targeted re-runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worklist {
    pub entries: Vec<WorklistEntry>,
}

/// One scanner's explicit transcript list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorklistEntry {
    pub scanner: String,
    pub transcripts: Vec<String>,
}
