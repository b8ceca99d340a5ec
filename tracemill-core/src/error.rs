use std::path::PathBuf;

use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Unit-scoped failures (scanner errors, single-key recording failures,
/// missing archive members) never escalate to run-scoped failures; the
/// scheduler converts them into error-typed result records or skips. The
/// run-scoped variants (`StoreUnreachable`, `SourceUnreachable`, `Worklist`)
/// are fatal with full detail.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed worklist file {path}: {reason}")]
    Worklist { path: PathBuf, reason: String },

    #[error("Scanner '{scanner}' failed on transcript '{transcript}': {message}")]
    Scanner {
        scanner: String,
        transcript: String,
        message: String,
        /// Set when the failure is a model refusal rather than a fault.
        refusal: bool,
    },

    #[error("Transcript '{0}' not found in source")]
    TranscriptNotFound(String),

    #[error("Archive member '{member}' not found in {archive}")]
    MemberNotFound { archive: String, member: String },

    #[error("Corrupt archive {archive}: {reason}")]
    CorruptArchive { archive: String, reason: String },

    #[error("Recorder failure for key ({scanner}, {transcript}): {reason}")]
    Record {
        scanner: String,
        transcript: String,
        reason: String,
    },

    #[error("Flush failed for scanner '{scanner}': {reason}")]
    Flush { scanner: String, reason: String },

    #[error("Registry storage error: {0}")]
    Registry(String),

    #[error("Durable result store unreachable at {location}: {reason}")]
    StoreUnreachable { location: PathBuf, reason: String },

    #[error("Transcript source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for failures scoped to one work unit.
    pub fn is_unit_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::Scanner { .. }
                | EngineError::TranscriptNotFound(_)
                | EngineError::MemberNotFound { .. }
                | EngineError::Record { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
