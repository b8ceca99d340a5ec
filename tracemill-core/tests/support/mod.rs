//! Shared fixtures for engine integration tests: a scriptable scanner, a
//! small on-disk transcript corpus, and an engine config isolated from the
//! host registry.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracemill_core::config::EngineConfig;
use tracemill_core::error::{EngineError, Result};
use tracemill_core::source::{Scanner, TranscriptContent};
use tracemill_model::{ConcurrencyLimits, ResultRecord, ScanSpec, ScannerDescriptor, SourceDescriptor};

/// Scanner driven by a fixed script: fails on listed transcript ids,
/// optionally sleeps a random few milliseconds to shuffle completion order,
/// and counts invocations.
pub struct ScriptedScanner {
    descriptor: ScannerDescriptor,
    fail_on: HashSet<String>,
    max_delay_ms: u64,
    invocations: AtomicUsize,
}

impl ScriptedScanner {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ScannerDescriptor::new(name),
            fail_on: HashSet::new(),
            max_delay_ms: 0,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn failing_on(name: &str, ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ScannerDescriptor::new(name),
            fail_on: ids.iter().map(|s| s.to_string()).collect(),
            max_delay_ms: 0,
            invocations: AtomicUsize::new(0),
        })
    }

    /// Scanner that sleeps up to `max_delay_ms` per transcript, shuffling
    /// completion order across concurrent tasks.
    pub fn jittered(name: &str, max_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ScannerDescriptor::new(name),
            fail_on: HashSet::new(),
            max_delay_ms,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for ScriptedScanner {
    fn descriptor(&self) -> &ScannerDescriptor {
        &self.descriptor
    }

    async fn scan(&self, transcript: TranscriptContent) -> Result<Vec<ResultRecord>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.max_delay_ms > 0 {
            let ms = rand::random_range(0..self.max_delay_ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.fail_on.contains(&transcript.id) {
            return Err(EngineError::Scanner {
                scanner: self.descriptor.name.clone(),
                transcript: transcript.id,
                message: "scripted failure".to_string(),
                refusal: false,
            });
        }
        Ok(vec![ResultRecord::value(
            &self.descriptor.name,
            &transcript.id,
            "length",
            transcript.body.len() as u64,
        )])
    }
}

/// Write `ids` as a flat directory of `.json` transcripts.
pub fn write_corpus(dir: &Path, ids: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for id in ids {
        let body = format!(r#"{{"id":"{id}","messages":[{{"role":"user","content":"hi"}}]}}"#);
        std::fs::write(dir.join(format!("{id}.json")), body).unwrap();
    }
}

pub fn spec_for(corpus: &Path, output: &Path, scanner_names: &[&str]) -> ScanSpec {
    ScanSpec {
        scanners: scanner_names
            .iter()
            .map(|n| ScannerDescriptor::new(*n))
            .collect(),
        source: SourceDescriptor {
            kind: "fs".to_string(),
            location: corpus.display().to_string(),
        },
        limits: ConcurrencyLimits::default(),
        output: output.to_path_buf(),
    }
}

/// Engine config pointing the registry into the test's own scratch space and
/// flushing aggressively. Also installs the tracing subscriber so failing
/// tests show engine logs under `RUST_LOG`.
pub fn test_config(scratch: &Path) -> EngineConfig {
    tracemill_core::logging::init_tracing();
    EngineConfig {
        flush_interval: Duration::from_millis(200),
        metrics_interval: Duration::from_millis(100),
        registry_path: scratch.join("registry"),
        ..EngineConfig::default()
    }
}

/// Rows of one scanner's durable table, in file order.
pub fn read_table(output: &Path, scanner: &str) -> Vec<ResultRecord> {
    let path = output
        .join("tables")
        .join(format!("{}.jsonl", tracemill_core::recorder::encode_scanner_name(scanner)));
    let content = std::fs::read_to_string(path).unwrap();
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
