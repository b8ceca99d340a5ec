//! Run orchestration: plan, execute, summarize.
//!
//! A run drives the planner's lazy unit stream through the scheduler,
//! registers itself in the cross-process registry for the duration, and
//! finishes by writing the summary and manifest artifacts next to the
//! durable tables. Re-running the same spec against the same output
//! location resumes: recorded keys are skipped at planning time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tracemill_model::{
    ActiveScanInfo, RunManifest, RunStatus, RunSummary, ScanSpec, WorkUnit, Worklist,
};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::planner;
use crate::recorder::RecorderBuffer;
use crate::registry::ActiveScanRegistry;
use crate::scheduler::{ExecutionReport, ExecutionScheduler};
use crate::source::{Scanner, TranscriptSource};

/// Scan engine facade: owns the configured scanners and transcript source,
/// and executes specs against them.
pub struct ScanEngine {
    config: EngineConfig,
    scanners: Vec<Arc<dyn Scanner>>,
    source: Arc<dyn TranscriptSource>,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("scanners", &self.scanners.len())
            .finish_non_exhaustive()
    }
}

impl ScanEngine {
    pub fn new(
        config: EngineConfig,
        scanners: Vec<Arc<dyn Scanner>>,
        source: Arc<dyn TranscriptSource>,
    ) -> Self {
        Self {
            config,
            scanners,
            source,
        }
    }

    /// Execute `spec` to completion or interruption.
    ///
    /// An empty corpus (or empty scanner list) short-circuits to an empty
    /// complete summary without creating any output artifact.
    pub async fn run(&self, spec: &ScanSpec, cancel: CancellationToken) -> Result<RunSummary> {
        let recorder = Arc::new(RecorderBuffer::open(&spec.output).await?);
        let mut units = planner::plan(spec, self.source.as_ref(), &recorder);

        // Pull one unit before creating anything durable.
        let Some(first) = units.next().await else {
            return self.finish_without_scanning(spec, &recorder).await;
        };
        let units = futures::stream::iter(std::iter::once(first))
            .chain(units)
            .boxed();

        self.execute(spec, recorder.clone(), units, cancel).await
    }

    /// Execute an explicit worklist instead of live source enumeration.
    /// A malformed worklist file is fatal before any scanning starts.
    pub async fn run_worklist(
        &self,
        spec: &ScanSpec,
        worklist_path: &Path,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let worklist = planner::load_worklist(worklist_path).await?;
        self.run_loaded_worklist(spec, &worklist, cancel).await
    }

    pub async fn run_loaded_worklist(
        &self,
        spec: &ScanSpec,
        worklist: &Worklist,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let recorder = Arc::new(RecorderBuffer::open(&spec.output).await?);
        let mut units = planner::plan_worklist(worklist, &recorder);
        let Some(first) = units.next().await else {
            return self.finish_without_scanning(spec, &recorder).await;
        };
        let units = futures::stream::iter(std::iter::once(first))
            .chain(units)
            .boxed();

        self.execute(spec, recorder.clone(), units, cancel).await
    }

    /// Resume an interrupted run. A prior summary marked complete is
    /// returned as-is without touching the store.
    pub async fn resume(&self, spec: &ScanSpec, cancel: CancellationToken) -> Result<RunSummary> {
        if let Some(prior) = RecorderBuffer::read_summary(&spec.output).await? {
            if prior.status == RunStatus::Complete {
                info!(location = %spec.output.display(), "prior run already complete");
                return Ok(prior);
            }
        }
        self.run(spec, cancel).await
    }

    /// Run with staging pre-seeded from a prior durable location, carrying
    /// over only the keys known to be in sync.
    pub async fn run_seeded(
        &self,
        spec: &ScanSpec,
        prior: &Path,
        synced_keys: &HashSet<(String, String)>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let recorder = Arc::new(RecorderBuffer::open(&spec.output).await?);
        recorder.seed_from(prior, synced_keys).await?;

        let mut units = planner::plan(spec, self.source.as_ref(), &recorder);
        let Some(first) = units.next().await else {
            return self.finish_without_scanning(spec, &recorder).await;
        };
        let units = futures::stream::iter(std::iter::once(first))
            .chain(units)
            .boxed();

        self.execute(spec, recorder.clone(), units, cancel).await
    }

    /// Count plannable units per scanner without running anything.
    pub async fn dry_run(
        &self,
        spec: &ScanSpec,
    ) -> Result<std::collections::BTreeMap<String, usize>> {
        let recorder = RecorderBuffer::open(&spec.output).await?;
        planner::dry_run(spec, self.source.as_ref(), &recorder).await
    }

    /// The planner produced no units. A recorder that already holds state
    /// means every matching unit was recorded by a prior pass that died
    /// before finalizing; flush and close it out as complete. Only a truly
    /// empty complement skips output artifacts altogether.
    async fn finish_without_scanning(
        &self,
        spec: &ScanSpec,
        recorder: &RecorderBuffer,
    ) -> Result<RunSummary> {
        if recorder.scanner_counts().await.is_empty() {
            info!("nothing to scan, skipping output entirely");
            return Ok(RunSummary::empty(spec.output.clone()));
        }

        info!(
            location = %spec.output.display(),
            "all planned units already recorded, finalizing prior state"
        );
        let started_at = RecorderBuffer::read_summary(&spec.output)
            .await?
            .map(|s| s.started_at)
            .unwrap_or_else(Utc::now);
        self.finalize(spec, recorder, RunStatus::Complete, started_at)
            .await
    }

    async fn execute(
        &self,
        spec: &ScanSpec,
        recorder: Arc<RecorderBuffer>,
        units: futures::stream::BoxStream<'_, Result<WorkUnit>>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let scan_id = Uuid::new_v4();

        // Registry trouble never blocks scanning; the registry is shared
        // convenience state, results are the durable contract.
        let registry = match ActiveScanRegistry::open(&self.config.registry_path) {
            Ok(registry) => Some(Arc::new(registry)),
            Err(e) => {
                warn!(error = %e, "registry unavailable, continuing unregistered");
                None
            }
        };
        if let Some(registry) = &registry {
            let info = ActiveScanInfo::new(
                scan_id,
                describe_spec(spec),
                spec.output.display().to_string(),
                0,
            );
            if let Err(e) = registry.put_scan(&info) {
                warn!(error = %e, "failed to register scan");
            }
        }

        let scheduler = ExecutionScheduler::new(
            self.config.clone(),
            spec.limits,
            self.scanners.clone(),
            self.source.clone(),
            recorder.clone(),
        );

        let metrics_registry = registry.clone();
        let report = scheduler
            .execute(units, cancel, move |metrics| {
                if let Some(registry) = &metrics_registry {
                    if let Err(e) = registry.put_metrics(scan_id, metrics) {
                        debug!(error = %e, "metrics tick dropped");
                    }
                }
            })
            .await;

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                // Fatal planner failure: persist what we have as interrupted
                // so the location stays resumable, then surface the error.
                let summary = self
                    .finalize(spec, &recorder, RunStatus::Interrupted, started_at)
                    .await?;
                debug!(errors = summary.total_errors(), "interrupted summary persisted");
                if let Some(registry) = &registry {
                    let _ = registry.mark_interrupted(scan_id, Some(e.to_string()));
                }
                return Err(e);
            }
        };

        let status = if report.is_complete() {
            RunStatus::Complete
        } else {
            RunStatus::Interrupted
        };
        let summary = self.finalize(spec, &recorder, status, started_at).await?;

        if let Some(registry) = &registry {
            // The plan stream is fully drained here, so the dispatched count
            // is the final unit total for this run.
            if let Err(e) = registry.put_total(scan_id, report.planned) {
                debug!(error = %e, "total update dropped");
            }
            let outcome = match status {
                RunStatus::Complete => registry.mark_completed(scan_id),
                RunStatus::Interrupted => registry.mark_interrupted(scan_id, None),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "failed to mark scan terminal in registry");
            }
        }

        log_report(&report, status);
        Ok(summary)
    }

    async fn finalize(
        &self,
        spec: &ScanSpec,
        recorder: &RecorderBuffer,
        status: RunStatus,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<RunSummary> {
        match status {
            RunStatus::Complete => recorder.cleanup().await?,
            // Keep staging on interrupt; resume picks it up.
            RunStatus::Interrupted => recorder.flush().await?,
        }

        let finished_at = Some(Utc::now());
        let summary = RunSummary {
            status,
            scanners: recorder.scanner_counts().await,
            location: spec.output.clone(),
            started_at,
            finished_at,
        };
        recorder.write_summary(&summary).await?;
        recorder
            .write_manifest(&RunManifest {
                scanners: spec.scanners.clone(),
                source: spec.source.clone(),
                started_at,
                finished_at,
            })
            .await?;
        Ok(summary)
    }
}

/// Load a prior run's summary, if its location holds one.
pub async fn run_status(location: &Path) -> Result<Option<RunSummary>> {
    RecorderBuffer::read_summary(location).await
}

/// Accept a durable location as final without further scanning: flush any
/// staged remains, drop staging, and rewrite the summary as complete.
pub async fn complete(location: &Path) -> Result<RunSummary> {
    let prior = RecorderBuffer::read_summary(location).await?;
    let recorder = RecorderBuffer::open(location).await?;
    recorder.cleanup().await?;

    let summary = RunSummary {
        status: RunStatus::Complete,
        scanners: recorder.scanner_counts().await,
        location: location.to_path_buf(),
        started_at: prior.map(|s| s.started_at).unwrap_or_else(Utc::now),
        finished_at: Some(Utc::now()),
    };
    recorder.write_summary(&summary).await?;
    Ok(summary)
}

fn describe_spec(spec: &ScanSpec) -> String {
    format!(
        "{} scanner(s) over {} source at {}",
        spec.scanners.len(),
        spec.source.kind,
        spec.source.location
    )
}

fn log_report(report: &ExecutionReport, status: RunStatus) {
    info!(
        planned = report.planned,
        completed = report.completed,
        errors = report.errors,
        status = ?status,
        "run finished"
    );
}
