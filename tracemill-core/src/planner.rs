//! Lazy work planning with resume support.
//!
//! The planner streams not-yet-recorded (scanner, transcript) pairs without
//! ever materializing the corpus: transcripts are enumerated lazily and
//! crossed with the declared scanners, and resume falls out of the recorder's
//! `is_recorded` check rather than any scheduler bookkeeping.

use std::collections::BTreeMap;
use std::path::Path;

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::info;

use tracemill_model::{ScanSpec, TranscriptRef, WorkUnit, Worklist};

use crate::error::{EngineError, Result};
use crate::recorder::RecorderBuffer;
use crate::source::TranscriptSource;

/// Stream the not-yet-recorded work units for `spec`.
pub fn plan<'a>(
    spec: &'a ScanSpec,
    source: &'a dyn TranscriptSource,
    recorder: &'a RecorderBuffer,
) -> BoxStream<'a, Result<WorkUnit>> {
    Box::pin(async_stream::try_stream! {
        let mut transcripts = source.enumerate();
        while let Some(transcript) = transcripts.next().await {
            let transcript = transcript?;
            for scanner in &spec.scanners {
                if recorder.is_recorded(&transcript.id, &scanner.name).await {
                    continue;
                }
                yield WorkUnit::new(scanner.name.clone(), transcript.clone());
            }
        }
    })
}

/// Stream work units from an explicit worklist, bypassing live enumeration.
/// Recorded keys are still skipped, so a worklist re-run is resumable too.
pub fn plan_worklist<'a>(
    worklist: &'a Worklist,
    recorder: &'a RecorderBuffer,
) -> BoxStream<'a, Result<WorkUnit>> {
    Box::pin(async_stream::try_stream! {
        for entry in &worklist.entries {
            for id in &entry.transcripts {
                if recorder.is_recorded(id, &entry.scanner).await {
                    continue;
                }
                yield WorkUnit::new(entry.scanner.clone(), TranscriptRef::new(id.clone()));
            }
        }
    })
}

/// Load a worklist file in JSON or TOML form. A malformed file is fatal and
/// reported before any scanning starts.
pub async fn load_worklist(path: &Path) -> Result<Worklist> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Worklist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str::<Worklist>(&content).map_err(|e| e.to_string()),
        Some("toml") => toml::from_str::<Worklist>(&content).map_err(|e| e.to_string()),
        _ => serde_json::from_str::<Worklist>(&content)
            .map_err(|e| e.to_string())
            .or_else(|json_err| {
                toml::from_str::<Worklist>(&content)
                    .map_err(|toml_err| format!("not JSON ({json_err}) nor TOML ({toml_err})"))
            }),
    };

    let worklist = parsed.map_err(|reason| EngineError::Worklist {
        path: path.to_path_buf(),
        reason,
    })?;
    if worklist.entries.iter().any(|e| e.scanner.is_empty()) {
        return Err(EngineError::Worklist {
            path: path.to_path_buf(),
            reason: "entry with empty scanner name".to_string(),
        });
    }
    info!(path = %path.display(), entries = worklist.entries.len(), "loaded worklist");
    Ok(worklist)
}

/// Dry-run: count plannable units per scanner without invoking any scanner
/// or creating any artifact.
pub async fn dry_run(
    spec: &ScanSpec,
    source: &dyn TranscriptSource,
    recorder: &RecorderBuffer,
) -> Result<BTreeMap<String, usize>> {
    let mut counts: BTreeMap<String, usize> = spec
        .scanners
        .iter()
        .map(|s| (s.name.clone(), 0))
        .collect();
    let mut units = plan(spec, source, recorder);
    while let Some(unit) = units.next().await {
        let unit = unit?;
        *counts.entry(unit.scanner).or_insert(0) += 1;
    }
    Ok(counts)
}
