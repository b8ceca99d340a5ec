use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracemill_model::{ResultRecord, ScannerDescriptor, Segment, SourceDescriptor, TranscriptRef};

use crate::error::{EngineError, Result};

/// Content restriction applied when fetching a transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentFilter {
    /// Full conversation content.
    #[default]
    Full,
    /// Metadata only, no message bodies.
    MetadataOnly,
}

/// Typed transcript content handed to scanners.
///
/// Conversion of raw logs into typed conversation objects is a collaborator
/// concern; the engine moves bytes and an identifier.
#[derive(Debug, Clone)]
pub struct TranscriptContent {
    pub id: String,
    pub body: Vec<u8>,
    /// Set when this content is being scanned as one segment of a split
    /// transcript; the scanner restricts itself to that slice.
    pub segment: Option<Segment>,
}

/// One analysis function run over transcripts.
///
/// Scanners return results asynchronously; any error they raise is converted
/// by the scheduler into an error-typed [`ResultRecord`] and never aborts the
/// run.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn descriptor(&self) -> &ScannerDescriptor;

    async fn scan(&self, transcript: TranscriptContent) -> Result<Vec<ResultRecord>>;
}

/// Lazy, restartable access to a transcript corpus.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    fn descriptor(&self) -> SourceDescriptor;

    /// Lazily enumerate transcript references. Restartable: each call yields
    /// a fresh pass over the corpus.
    fn enumerate(&self) -> BoxStream<'_, Result<TranscriptRef>>;

    /// Random-access read of one transcript's content.
    async fn read(&self, id: &str, filter: ContentFilter) -> Result<TranscriptContent>;
}

/// Transcript source over a flat directory of `.json` / `.jsonl` transcript
/// files. The file stem is the transcript id.
#[derive(Debug, Clone)]
pub struct FsTranscriptSource {
    root: PathBuf,
}

impl FsTranscriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn is_transcript(path: &std::path::Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("jsonl")
        )
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        for ext in ["json", "jsonl"] {
            let candidate = self.root.join(format!("{id}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

#[async_trait]
impl TranscriptSource for FsTranscriptSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            kind: "fs".to_string(),
            location: self.root.display().to_string(),
        }
    }

    fn enumerate(&self) -> BoxStream<'_, Result<TranscriptRef>> {
        Box::pin(async_stream::try_stream! {
            let mut entries = match tokio::fs::read_dir(&self.root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Empty corpus is a non-fatal terminal case.
                    return;
                }
                Err(e) => Err(EngineError::SourceUnreachable(format!(
                    "{}: {e}",
                    self.root.display()
                )))?,
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(EngineError::Io)?
            {
                let path = entry.path();
                if !Self::is_transcript(&path) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    yield TranscriptRef::new(stem);
                }
            }
        })
    }

    async fn read(&self, id: &str, _filter: ContentFilter) -> Result<TranscriptContent> {
        let path = self
            .path_for(id)
            .ok_or_else(|| EngineError::TranscriptNotFound(id.to_string()))?;
        let body = tokio::fs::read(&path).await?;
        Ok(TranscriptContent {
            id: id.to_string(),
            body,
            segment: None,
        })
    }
}
