//! Concurrent execution of planned work units.
//!
//! Work is distributed over N worker groups of M cooperative tasks pulling
//! from one shared queue; the worker group is the fault-isolation seam.
//! Dispatch follows planner order, completion order is unconstrained except
//! for segmented transcripts, which pass through the in-order collection
//! barrier in [`segment`]. Scanner failures become error-typed result
//! records and never abort the run.

pub mod segment;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tracemill_model::{
    ConcurrencyLimits, RecordError, ResultRecord, ScanMetrics, TaskState, WorkUnit,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::metrics_probe::MemoryProbe;
use crate::recorder::RecorderBuffer;
use crate::scheduler::segment::SegmentAssembler;
use crate::source::{ContentFilter, Scanner, TranscriptSource};

const STATE_IDLE: u8 = 0;
const STATE_PARSING: u8 = 1;
const STATE_SCANNING: u8 = 2;

/// Per-task lifecycle slot: `idle -> parsing -> scanning -> idle`, with the
/// last transition time feeding the hang watchdog.
#[derive(Debug)]
pub struct TaskSlot {
    worker: usize,
    state: AtomicU8,
    transitioned_at_ms: AtomicU64,
    started: Instant,
}

impl TaskSlot {
    fn new(worker: usize, started: Instant) -> Self {
        Self {
            worker,
            state: AtomicU8::new(STATE_IDLE),
            transitioned_at_ms: AtomicU64::new(0),
            started,
        }
    }

    fn set(&self, state: TaskState) {
        let raw = match state {
            TaskState::Idle => STATE_IDLE,
            TaskState::Parsing => STATE_PARSING,
            TaskState::Scanning => STATE_SCANNING,
        };
        self.state.store(raw, Ordering::Relaxed);
        self.transitioned_at_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn state(&self) -> TaskState {
        match self.state.load(Ordering::Relaxed) {
            STATE_PARSING => TaskState::Parsing,
            STATE_SCANNING => TaskState::Scanning,
            _ => TaskState::Idle,
        }
    }

    fn since_transition(&self) -> Duration {
        let at = Duration::from_millis(self.transitioned_at_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(at)
    }
}

/// Shared gauge for scanners that batch several transcripts behind one
/// underlying call. The flusher forces a flush once the oldest pending
/// transcript exceeds the configured timeout.
#[derive(Debug, Default)]
pub struct BatchBacklog {
    pending: AtomicUsize,
    oldest: std::sync::Mutex<Option<Instant>>,
}

impl BatchBacklog {
    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut oldest = self.oldest.lock().unwrap_or_else(|e| e.into_inner());
        if self.pending.fetch_add(n, Ordering::Relaxed) == 0 {
            *oldest = Some(Instant::now());
        }
    }

    pub fn drain(&self, n: usize) {
        let mut oldest = self.oldest.lock().unwrap_or_else(|e| e.into_inner());
        let before = self.pending.load(Ordering::Relaxed);
        let after = before.saturating_sub(n);
        self.pending.store(after, Ordering::Relaxed);
        if after == 0 {
            *oldest = None;
        } else if n > 0 {
            // Remaining entries are younger than the drained batch head.
            *oldest = Some(Instant::now());
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn oldest_age(&self) -> Option<Duration> {
        self.oldest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed())
    }
}

/// Outcome of one scheduler execution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Units pulled from the planner and dispatched.
    pub planned: usize,
    /// Units with a terminal (recorded) outcome.
    pub completed: usize,
    /// Units whose terminal outcome is an error record.
    pub errors: usize,
    /// True when an interrupt stopped dispatch before the plan was covered.
    pub interrupted: bool,
}

impl ExecutionReport {
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.completed == self.planned
    }
}

struct WorkerCtx {
    scanners: HashMap<String, Arc<dyn Scanner>>,
    source: Arc<dyn TranscriptSource>,
    recorder: Arc<RecorderBuffer>,
    assembler: SegmentAssembler,
    completed: AtomicUsize,
    errors: AtomicUsize,
    dispatched: AtomicUsize,
}

/// Executes work units concurrently within configured limits, feeding
/// results to the recorder.
pub struct ExecutionScheduler {
    config: EngineConfig,
    limits: ConcurrencyLimits,
    ctx: Arc<WorkerCtx>,
    backlog: Arc<BatchBacklog>,
    probe: Arc<MemoryProbe>,
}

impl std::fmt::Debug for ExecutionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ExecutionScheduler {
    pub fn new(
        config: EngineConfig,
        limits: ConcurrencyLimits,
        scanners: Vec<Arc<dyn Scanner>>,
        source: Arc<dyn TranscriptSource>,
        recorder: Arc<RecorderBuffer>,
    ) -> Self {
        let scanners = scanners
            .into_iter()
            .map(|s| (s.descriptor().name.clone(), s))
            .collect();
        Self {
            config,
            limits,
            ctx: Arc::new(WorkerCtx {
                scanners,
                source,
                recorder,
                assembler: SegmentAssembler::new(),
                completed: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
            }),
            backlog: Arc::new(BatchBacklog::default()),
            probe: Arc::new(MemoryProbe::new()),
        }
    }

    /// Gauge handed to batching scanners.
    pub fn batch_backlog(&self) -> Arc<BatchBacklog> {
        self.backlog.clone()
    }

    /// Drive `units` to a terminal outcome each, within concurrency limits.
    ///
    /// Cancelling `cancel` stops new dispatch, grants in-flight units the
    /// configured grace period, and reports the pass as interrupted; work in
    /// flight at a forced stop stays unrecorded and therefore resumable.
    pub async fn execute(
        &self,
        mut units: BoxStream<'_, Result<WorkUnit>>,
        cancel: CancellationToken,
        on_metrics: impl Fn(ScanMetrics) + Send + Sync + 'static,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        let task_count = self.limits.workers.max(1) * self.limits.tasks_per_worker.max(1);
        let slots: Vec<Arc<TaskSlot>> = (0..task_count)
            .map(|i| Arc::new(TaskSlot::new(i / self.limits.tasks_per_worker.max(1), started)))
            .collect();

        let (tx, rx) = mpsc::channel::<WorkUnit>(self.config.queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        // Worker handles live in per-slot cells so the watchdog can abort
        // and respawn a hung slot without coordinating with the join below.
        let handles: Arc<WorkerHandles> = Arc::new(
            (0..task_count)
                .map(|_| std::sync::Mutex::new(None))
                .collect(),
        );
        for (task, slot) in slots.iter().enumerate() {
            let handle = spawn_worker(
                self.ctx.clone(),
                rx.clone(),
                slot.clone(),
                cancel.clone(),
            );
            *handles[task].lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        let aux_cancel = CancellationToken::new();
        let aux = self.spawn_aux_tasks(&slots, &handles, &rx, &cancel, &aux_cancel, on_metrics);

        // Dispatch in planner order, bounded by recorder acceptance capacity.
        let mut planner_failure: Option<EngineError> = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = units.next() => next,
            };
            let Some(next) = next else { break };
            match next {
                Ok(unit) => {
                    while self.ctx.recorder.buffered_len() >= self.config.max_buffered_results
                        && !cancel.is_cancelled()
                    {
                        if let Err(e) = self.ctx.recorder.flush().await {
                            warn!(error = %e, "backpressure flush failed, retrying");
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                    }
                    self.ctx.dispatched.fetch_add(1, Ordering::Relaxed);
                    if tx.send(unit).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Planner failures are run-scoped: stop dispatch, surface.
                    error!(error = %e, "planner failed, stopping dispatch");
                    planner_failure = Some(e);
                    cancel.cancel();
                    break;
                }
            }
        }
        drop(tx);

        let interrupted = cancel.is_cancelled();
        let deadline = Instant::now() + self.config.shutdown_grace;
        for slot_handle in handles.iter() {
            loop {
                let finished = slot_handle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .map(|h| h.is_finished())
                    .unwrap_or(true);
                if finished {
                    break;
                }
                if interrupted && Instant::now() >= deadline {
                    warn!("worker exceeded shutdown grace, aborting");
                    let taken = slot_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
                    if let Some(handle) = taken {
                        handle.abort();
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let taken = slot_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = taken {
                match handle.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    // A worker panic is a crash of its isolation unit: its
                    // unit stays unrecorded and resumable.
                    Err(e) => error!(error = %e, "worker crashed; in-flight unit remains resumable"),
                }
            }
        }

        aux_cancel.cancel();
        for handle in aux {
            let _ = handle.await;
        }

        if let Err(e) = self.ctx.recorder.flush().await {
            warn!(error = %e, "final flush failed; staged rows retained for retry");
        }

        if let Some(e) = planner_failure {
            return Err(e);
        }

        let report = ExecutionReport {
            planned: self.ctx.dispatched.load(Ordering::Relaxed),
            completed: self.ctx.completed.load(Ordering::Relaxed),
            errors: self.ctx.errors.load(Ordering::Relaxed),
            interrupted,
        };
        info!(
            planned = report.planned,
            completed = report.completed,
            errors = report.errors,
            interrupted = report.interrupted,
            "scheduler pass finished"
        );
        Ok(report)
    }

    fn spawn_aux_tasks(
        &self,
        slots: &[Arc<TaskSlot>],
        handles: &Arc<WorkerHandles>,
        rx: &Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
        worker_cancel: &CancellationToken,
        aux_cancel: &CancellationToken,
        on_metrics: impl Fn(ScanMetrics) + Send + Sync + 'static,
    ) -> Vec<JoinHandle<()>> {
        let mut aux = Vec::new();

        // Throttled metrics sampling.
        {
            let slots = slots.to_vec();
            let ctx = self.ctx.clone();
            let backlog = self.backlog.clone();
            let probe = self.probe.clone();
            let limits = self.limits;
            let cancel = aux_cancel.clone();
            let interval = self.config.metrics_interval;
            aux.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let mut metrics = ScanMetrics {
                        processes: limits.workers.max(1),
                        tasks: slots.len(),
                        ..ScanMetrics::default()
                    };
                    for slot in &slots {
                        match slot.state() {
                            TaskState::Idle => metrics.idle += 1,
                            TaskState::Parsing => metrics.parsing += 1,
                            TaskState::Scanning => metrics.scanning += 1,
                        }
                    }
                    let dispatched = ctx.dispatched.load(Ordering::Relaxed);
                    let completed = ctx.completed.load(Ordering::Relaxed);
                    metrics.queued = dispatched.saturating_sub(completed);
                    metrics.completed = completed;
                    metrics.buffered = ctx.recorder.buffered_len();
                    metrics.memory_bytes = probe.rss_bytes();
                    metrics.batch_pending = backlog.pending();
                    metrics.oldest_pending_secs =
                        backlog.oldest_age().map(|d| d.as_secs()).unwrap_or(0);
                    on_metrics(metrics);
                }
            }));
        }

        // Periodic flush, forced early when the batch backlog goes stale.
        {
            let recorder = self.ctx.recorder.clone();
            let backlog = self.backlog.clone();
            let cancel = aux_cancel.clone();
            let flush_interval = self.config.flush_interval;
            let pending_timeout = self.config.batch_pending_timeout;
            aux.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1).min(flush_interval));
                let mut last_flush = Instant::now();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let stale = backlog
                        .oldest_age()
                        .is_some_and(|age| age >= pending_timeout);
                    if last_flush.elapsed() >= flush_interval || stale {
                        if stale {
                            debug!(pending = backlog.pending(), "batch backlog stale, forcing flush");
                        }
                        if let Err(e) = recorder.flush().await {
                            warn!(error = %e, "periodic flush failed; will retry");
                        }
                        last_flush = Instant::now();
                    }
                }
            }));
        }

        // Hang watchdog: a task stuck past the deadline is aborted and its
        // slot respawned; the in-flight unit stays unrecorded and resumable.
        {
            let slots = slots.to_vec();
            let handles = handles.clone();
            let ctx = self.ctx.clone();
            let rx = rx.clone();
            let worker_cancel = worker_cancel.clone();
            let cancel = aux_cancel.clone();
            let deadline = self.config.hang_deadline;
            aux.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval((deadline / 4).max(Duration::from_millis(250)));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    for (task, slot) in slots.iter().enumerate() {
                        let state = slot.state();
                        if state == TaskState::Idle || slot.since_transition() <= deadline {
                            continue;
                        }
                        warn!(
                            worker = slot.worker,
                            task,
                            state = ?state,
                            stalled_secs = slot.since_transition().as_secs(),
                            "task hung past deadline, restarting"
                        );
                        let mut guard =
                            handles[task].lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(handle) = guard.take() {
                            handle.abort();
                        }
                        slot.set(TaskState::Idle);
                        *guard = Some(spawn_worker(
                            ctx.clone(),
                            rx.clone(),
                            slot.clone(),
                            worker_cancel.clone(),
                        ));
                    }
                }
            }));
        }

        aux
    }
}

type WorkerHandles = Vec<std::sync::Mutex<Option<JoinHandle<()>>>>;

fn spawn_worker(
    ctx: Arc<WorkerCtx>,
    rx: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    slot: Arc<TaskSlot>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        worker_loop(ctx, rx, slot, cancel).await;
    })
}

async fn worker_loop(
    ctx: Arc<WorkerCtx>,
    rx: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    slot: Arc<TaskSlot>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let unit = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                unit = rx.recv() => unit,
            }
        };
        let Some(unit) = unit else { break };
        process_unit(&ctx, unit, &slot).await;
        slot.set(TaskState::Idle);
    }
}

async fn process_unit(ctx: &WorkerCtx, unit: WorkUnit, slot: &TaskSlot) {
    slot.set(TaskState::Parsing);

    let rows = match ctx.scanners.get(&unit.scanner) {
        Some(scanner) => {
            let scanner = scanner.clone();
            match ctx
                .source
                .read(&unit.transcript.id, ContentFilter::Full)
                .await
            {
                Ok(mut content) => {
                    content.segment = unit.segment;
                    slot.set(TaskState::Scanning);
                    match scanner.scan(content).await {
                        Ok(rows) if !rows.is_empty() => normalize_rows(rows, &unit),
                        Ok(_) => vec![failure_row(
                            &unit,
                            "scanner returned no results".to_string(),
                            None,
                            false,
                        )],
                        Err(e) => vec![engine_failure_row(&unit, e)],
                    }
                }
                Err(e) => vec![engine_failure_row(&unit, e)],
            }
        }
        None => vec![failure_row(
            &unit,
            format!("no scanner registered under '{}'", unit.scanner),
            None,
            false,
        )],
    };

    let had_error = rows.iter().any(ResultRecord::is_error);

    let to_record = match unit.segment {
        Some(seg) => {
            match ctx.assembler.submit(
                &unit.scanner,
                &unit.transcript.id,
                seg.index,
                seg.count,
                rows,
            ) {
                Ok(assembled) => assembled,
                Err(e) => {
                    error!(error = %e, scanner = %unit.scanner, transcript = %unit.transcript.id,
                        "segment reassembly failed");
                    return;
                }
            }
        }
        None => Some(rows),
    };

    if let Some(rows) = to_record {
        if let Err(e) = ctx
            .recorder
            .record(&unit.scanner, &unit.transcript.id, rows)
            .await
        {
            // Single-key recording failure: isolated, the unit stays
            // resumable. Never escalated to the run.
            error!(error = %e, scanner = %unit.scanner, transcript = %unit.transcript.id,
                "failed to record unit result");
            return;
        }
    }

    if had_error {
        ctx.errors.fetch_add(1, Ordering::Relaxed);
    }
    ctx.completed.fetch_add(1, Ordering::Relaxed);
}

/// Force result rows onto the unit's logical key. Scanners fill values;
/// the engine owns key integrity.
fn normalize_rows(mut rows: Vec<ResultRecord>, unit: &WorkUnit) -> Vec<ResultRecord> {
    for row in &mut rows {
        row.scanner = unit.scanner.clone();
        row.transcript_id = unit.transcript.id.clone();
    }
    rows
}

fn engine_failure_row(unit: &WorkUnit, e: EngineError) -> ResultRecord {
    let refusal = matches!(&e, EngineError::Scanner { refusal: true, .. });
    failure_row(unit, e.to_string(), Some(format!("{e:?}")), refusal)
}

fn failure_row(
    unit: &WorkUnit,
    message: String,
    trace: Option<String>,
    refusal: bool,
) -> ResultRecord {
    ResultRecord::failure(
        &unit.scanner,
        &unit.transcript.id,
        RecordError {
            message,
            trace,
            refusal,
        },
    )
}
