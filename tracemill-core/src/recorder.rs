//! Durable, idempotent result recording.
//!
//! Results are staged per scanner under `<output>/staging/` and materialized
//! into one durable table per scanner under `<output>/tables/` on flush.
//! Flush is write-new-then-replace: the durable table is only ever swapped
//! for a complete replacement, so a failed flush leaves prior durable state
//! intact. A recorded key is visible to `is_recorded` immediately, with no
//! read-after-write lag.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use tracemill_model::{ResultRecord, RunManifest, RunSummary, ScannerCounts};

use crate::error::{EngineError, Result};

const TABLES_DIR: &str = "tables";
const STAGING_DIR: &str = "staging";
const SUMMARY_FILE: &str = "summary.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Map a scanner name onto a storage-safe file stem.
///
/// Deterministic and reversible: `_` escapes to `__`, any character outside
/// `[A-Za-z0-9.-]` is emitted as `_xHH` per UTF-8 byte. The logical key used
/// by `is_recorded` is always the original name.
pub fn encode_scanner_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '_' => out.push_str("__"),
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("_x{byte:02x}"));
                }
            }
        }
    }
    out
}

/// Invert [`encode_scanner_name`]. Returns `None` for strings that are not a
/// valid encoding.
pub fn decode_scanner_name(safe: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(safe.len());
    let mut chars = safe.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '_' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            '_' => bytes.push(b'_'),
            'x' => {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                bytes.push((hi * 16 + lo) as u8);
            }
            _ => return None,
        }
    }
    String::from_utf8(bytes).ok()
}

/// Mutable per-scanner recording state behind its own lock, so concurrent
/// writers for different scanners never contend.
#[derive(Debug, Default)]
struct ScannerPartition {
    safe: String,
    staged: Vec<ResultRecord>,
    /// Transcript ids with a result in staging or the durable table.
    recorded: HashSet<String>,
    results: usize,
    errors: usize,
}

/// Durable result buffer with local staging and idempotency queries.
#[derive(Debug)]
pub struct RecorderBuffer {
    output: PathBuf,
    partitions: DashMap<String, Arc<tokio::sync::Mutex<ScannerPartition>>>,
    buffered: AtomicUsize,
    completed: AtomicUsize,
}

impl RecorderBuffer {
    /// Open a buffer over `output`, loading any prior staging and durable
    /// state. Creates no directories; the first `record` call does.
    pub async fn open(output: impl Into<PathBuf>) -> Result<Self> {
        let output = output.into();
        let recorder = Self {
            output,
            partitions: DashMap::new(),
            buffered: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        };
        recorder.load_dir(TABLES_DIR, false).await?;
        recorder.load_dir(STAGING_DIR, true).await?;
        Ok(recorder)
    }

    pub fn location(&self) -> &Path {
        &self.output
    }

    fn tables_dir(&self) -> PathBuf {
        self.output.join(TABLES_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.output.join(STAGING_DIR)
    }

    fn partition(&self, scanner: &str) -> Arc<tokio::sync::Mutex<ScannerPartition>> {
        self.partitions
            .entry(scanner.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(ScannerPartition {
                    safe: encode_scanner_name(scanner),
                    ..ScannerPartition::default()
                }))
            })
            .clone()
    }

    async fn load_dir(&self, sub: &str, staged: bool) -> Result<()> {
        let dir = self.output.join(sub);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(scanner) = decode_scanner_name(stem) else {
                warn!(file = %path.display(), "skipping table with undecodable scanner name");
                continue;
            };
            let content = tokio::fs::read_to_string(&path).await?;
            let handle = self.partition(&scanner);
            let mut partition = handle.lock().await;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let row: ResultRecord = match serde_json::from_str(line) {
                    Ok(row) => row,
                    // A process killed mid-append leaves a truncated trailing
                    // staging line; its key was never marked recorded, so
                    // skipping keeps the unit resumable.
                    Err(e) if staged => {
                        warn!(
                            file = %path.display(),
                            error = %e,
                            "skipping unparsable staged row"
                        );
                        continue;
                    }
                    Err(e) => {
                        return Err(EngineError::StoreUnreachable {
                            location: path.clone(),
                            reason: format!("corrupt durable row: {e}"),
                        });
                    }
                };
                partition.recorded.insert(row.transcript_id.clone());
                if row.is_error() {
                    partition.errors += 1;
                } else {
                    partition.results += 1;
                }
                if staged {
                    partition.staged.push(row);
                    self.buffered.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// True iff a result for `(scanner, transcript)` exists in staging or the
    /// durable store.
    pub async fn is_recorded(&self, transcript: &str, scanner: &str) -> bool {
        let Some(handle) = self.partitions.get(scanner).map(|p| p.clone()) else {
            return false;
        };
        let partition = handle.lock().await;
        partition.recorded.contains(transcript)
    }

    /// Append result rows for one key into the scanner's staging partition.
    ///
    /// Re-recording an already-recorded key is a no-op: the first recording
    /// stays authoritative.
    pub async fn record(
        &self,
        scanner: &str,
        transcript: &str,
        rows: Vec<ResultRecord>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Err(EngineError::Record {
                scanner: scanner.to_string(),
                transcript: transcript.to_string(),
                reason: "empty result set".to_string(),
            });
        }
        let handle = self.partition(scanner);
        let mut partition = handle.lock().await;
        if partition.recorded.contains(transcript) {
            debug!(scanner, transcript, "key already recorded, skipping");
            return Ok(());
        }

        let staging = self.staging_dir();
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| EngineError::Record {
                scanner: scanner.to_string(),
                transcript: transcript.to_string(),
                reason: format!("staging dir: {e}"),
            })?;
        let path = staging.join(format!("{}.jsonl", partition.safe));
        let mut lines = String::new();
        for row in &rows {
            lines.push_str(&serde_json::to_string(row)?);
            lines.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EngineError::Record {
                scanner: scanner.to_string(),
                transcript: transcript.to_string(),
                reason: format!("staging append: {e}"),
            })?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| EngineError::Record {
                scanner: scanner.to_string(),
                transcript: transcript.to_string(),
                reason: format!("staging write: {e}"),
            })?;
        file.flush().await.map_err(EngineError::Io)?;

        let added = rows.len();
        for row in &rows {
            if row.is_error() {
                partition.errors += 1;
            } else {
                partition.results += 1;
            }
        }
        partition.staged.extend(rows);
        partition.recorded.insert(transcript.to_string());
        self.buffered.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    /// Materialize every scanner's staged rows into its durable table.
    ///
    /// Idempotent and safely repeatable; per-scanner table writes are
    /// serialized by the partition lock, and a failure for one scanner does
    /// not disturb the others' durable state.
    pub async fn flush(&self) -> Result<()> {
        let mut first_err = None;
        let scanners: Vec<String> = self.partitions.iter().map(|e| e.key().clone()).collect();
        for scanner in scanners {
            if let Err(e) = self.flush_scanner(&scanner).await {
                warn!(scanner = %scanner, error = %e, "flush failed for scanner table");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_scanner(&self, scanner: &str) -> Result<()> {
        let handle = self.partition(scanner);
        let mut partition = handle.lock().await;
        if partition.staged.is_empty() {
            return Ok(());
        }

        let tables = self.tables_dir();
        let table_path = tables.join(format!("{}.jsonl", partition.safe));
        let staging_path = self.staging_dir().join(format!("{}.jsonl", partition.safe));
        let staged: Vec<String> = partition
            .staged
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<_, _>>()?;

        let scanner_owned = scanner.to_string();
        let flushed = staged.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&tables)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&tables).map_err(|e| {
                EngineError::Flush {
                    scanner: scanner_owned.clone(),
                    reason: format!("temp table: {e}"),
                }
            })?;
            // New table = prior durable rows + staged rows, swapped in whole.
            if let Ok(existing) = std::fs::read(&table_path) {
                tmp.write_all(&existing).map_err(|e| EngineError::Flush {
                    scanner: scanner_owned.clone(),
                    reason: format!("copy durable rows: {e}"),
                })?;
            }
            for line in &staged {
                tmp.write_all(line.as_bytes())
                    .and_then(|_| tmp.write_all(b"\n"))
                    .map_err(|e| EngineError::Flush {
                        scanner: scanner_owned.clone(),
                        reason: format!("write staged rows: {e}"),
                    })?;
            }
            tmp.flush().map_err(|e| EngineError::Flush {
                scanner: scanner_owned.clone(),
                reason: format!("flush temp table: {e}"),
            })?;
            tmp.persist(&table_path).map_err(|e| EngineError::Flush {
                scanner: scanner_owned.clone(),
                reason: format!("replace table: {e}"),
            })?;
            // Staged rows are durable now; drop the staging shard.
            let _ = std::fs::remove_file(&staging_path);
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("flush task failed: {e}")))??;

        partition.staged.clear();
        self.buffered.fetch_sub(flushed, Ordering::Relaxed);
        self.completed.fetch_add(flushed, Ordering::Relaxed);
        debug!(scanner, rows = flushed, "flushed staged rows to durable table");
        Ok(())
    }

    /// Final flush plus staging removal.
    pub async fn cleanup(&self) -> Result<()> {
        self.flush().await?;
        match tokio::fs::remove_dir_all(self.staging_dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Seed local staging from a prior run's durable location.
    ///
    /// Only keys in `synced_keys` are carried over; keys this buffer already
    /// knows are left untouched (flush state is authoritative, seeding is
    /// advisory). Skipped entirely when local staging already exists, and
    /// creates no directory when there is nothing to seed.
    pub async fn seed_from(
        &self,
        prior: &Path,
        synced_keys: &HashSet<(String, String)>,
    ) -> Result<()> {
        if tokio::fs::try_exists(self.staging_dir()).await? {
            debug!("staging already present, skipping resume seed");
            return Ok(());
        }
        if synced_keys.is_empty() {
            return Ok(());
        }

        let prior_tables = prior.join(TABLES_DIR);
        let mut entries = match tokio::fs::read_dir(&prior_tables).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(scanner) = decode_scanner_name(stem) else {
                continue;
            };
            let content = tokio::fs::read_to_string(&path).await?;
            let mut by_transcript: BTreeMap<String, Vec<ResultRecord>> = BTreeMap::new();
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let row: ResultRecord = serde_json::from_str(line)?;
                let key = (scanner.clone(), row.transcript_id.clone());
                if synced_keys.contains(&key) {
                    by_transcript.entry(row.transcript_id.clone()).or_default().push(row);
                }
            }
            for (transcript, rows) in by_transcript {
                if self.is_recorded(&transcript, &scanner).await {
                    continue;
                }
                self.record(&scanner, &transcript, rows).await?;
            }
        }
        Ok(())
    }

    /// Rows recorded but not yet flushed, across all scanners.
    pub fn buffered_len(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Rows resident in durable tables.
    pub fn completed_len(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Per-scanner scan/result/error counts over staging plus durable state.
    pub async fn scanner_counts(&self) -> BTreeMap<String, ScannerCounts> {
        let mut counts = BTreeMap::new();
        for entry in self.partitions.iter() {
            let partition = entry.value().lock().await;
            counts.insert(
                entry.key().clone(),
                ScannerCounts {
                    scans: partition.recorded.len(),
                    results: partition.results,
                    errors: partition.errors,
                },
            );
        }
        counts
    }

    /// Atomically replace the run summary artifact.
    pub async fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        self.write_json(SUMMARY_FILE, summary).await
    }

    /// Atomically replace the run manifest artifact.
    pub async fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        self.write_json(MANIFEST_FILE, manifest).await
    }

    /// Load the run summary from a durable location, if present.
    pub async fn read_summary(location: &Path) -> Result<Option<RunSummary>> {
        match tokio::fs::read_to_string(location.join(SUMMARY_FILE)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let output = self.output.clone();
        let path = output.join(file);
        let body = serde_json::to_vec_pretty(value)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&output)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&output)?;
            tmp.write_all(&body)?;
            tmp.flush()?;
            tmp.persist(&path)
                .map_err(|e| EngineError::Internal(format!("persist {}: {e}", path.display())))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("write task failed: {e}")))?
    }
}
