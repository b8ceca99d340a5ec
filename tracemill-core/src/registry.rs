//! Cross-process registry of live and recently finished scans.
//!
//! Backed by an embedded sled tree at a well-known path, so sibling
//! processes (status CLIs, other runs) can list active scans without any
//! server. Entries are keyed `scan/<uuid>` and persist after their owner
//! exits; a store version bump wipes everything, which callers must treat
//! as normal loss of convenience state, never of scan results.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tracemill_model::{ActiveScanInfo, ScanMetrics};

use crate::error::{EngineError, Result};

/// Bumped whenever the serialized entry layout changes incompatibly. An
/// opened store carrying a different stamp is wiped wholesale.
const STORE_VERSION: u32 = 2;

const VERSION_KEY: &[u8] = b"meta/version";
const SCAN_PREFIX: &str = "scan/";

/// Registry of active scans shared between processes.
pub struct ActiveScanRegistry {
    db: sled::Db,
    path: PathBuf,
}

impl std::fmt::Debug for ActiveScanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveScanRegistry")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ActiveScanRegistry {
    /// Open (or create) the registry at `path`, wiping any entries written
    /// under a different store version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path).map_err(|e| EngineError::Registry(e.to_string()))?;

        let stored = db
            .get(VERSION_KEY)
            .map_err(|e| EngineError::Registry(e.to_string()))?
            .and_then(|raw| raw.as_ref().try_into().ok().map(u32::from_be_bytes));

        if stored != Some(STORE_VERSION) {
            if let Some(old) = stored {
                info!(old, new = STORE_VERSION, "registry version changed, wiping entries");
            }
            db.clear().map_err(|e| EngineError::Registry(e.to_string()))?;
            db.insert(VERSION_KEY, &STORE_VERSION.to_be_bytes()[..])
                .map_err(|e| EngineError::Registry(e.to_string()))?;
            db.flush().map_err(|e| EngineError::Registry(e.to_string()))?;
        }

        Ok(Self { db, path })
    }

    fn key(scan_id: Uuid) -> String {
        format!("{SCAN_PREFIX}{scan_id}")
    }

    fn write(&self, info: &ActiveScanInfo) -> Result<()> {
        let raw = serde_json::to_vec(info)?;
        self.db
            .insert(Self::key(info.scan_id).as_bytes(), raw)
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        Ok(())
    }

    fn read(&self, scan_id: Uuid) -> Result<Option<ActiveScanInfo>> {
        let raw = self
            .db
            .get(Self::key(scan_id).as_bytes())
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Register a freshly started scan.
    pub fn put_scan(&self, info: &ActiveScanInfo) -> Result<()> {
        debug!(scan_id = %info.scan_id, "registering scan");
        self.write(info)
    }

    /// Refresh the live metrics of a running scan. `last_updated` only ever
    /// moves forward; a stale tick racing a newer one is dropped.
    pub fn put_metrics(&self, scan_id: Uuid, metrics: ScanMetrics) -> Result<()> {
        let Some(mut info) = self.read(scan_id)? else {
            return Err(EngineError::Registry(format!(
                "metrics update for unregistered scan {scan_id}"
            )));
        };
        let now = Utc::now();
        if now < info.last_updated {
            return Ok(());
        }
        // Dispatched-so-far is a lower bound on the run's unit total; keep
        // the listed total current while the plan stream is still streaming.
        info.total_scans = info
            .total_scans
            .max(metrics.queued + metrics.completed);
        info.metrics = metrics;
        info.last_updated = now;
        self.write(&info)
    }

    /// Record the final unit total once the plan stream is fully drained.
    pub fn put_total(&self, scan_id: Uuid, total: usize) -> Result<()> {
        let Some(mut info) = self.read(scan_id)? else {
            return Err(EngineError::Registry(format!(
                "total update for unregistered scan {scan_id}"
            )));
        };
        info.total_scans = total;
        info.last_updated = Utc::now();
        self.write(&info)
    }

    /// Mark a scan as finished cleanly. The entry stays listed (not running)
    /// until a version bump wipes it.
    pub fn mark_completed(&self, scan_id: Uuid) -> Result<()> {
        self.mark_terminal(scan_id, None)
    }

    /// Mark a scan as interrupted, with an optional cause.
    pub fn mark_interrupted(&self, scan_id: Uuid, error: Option<String>) -> Result<()> {
        self.mark_terminal(scan_id, Some(error.unwrap_or_else(|| "interrupted".to_string())))
    }

    fn mark_terminal(&self, scan_id: Uuid, error: Option<String>) -> Result<()> {
        let Some(mut info) = self.read(scan_id)? else {
            // Terminal mark after a wipe is harmless.
            return Ok(());
        };
        info.running = false;
        info.error_message = error;
        info.last_updated = Utc::now();
        self.write(&info)
    }

    /// Remove one scan's entry.
    pub fn remove(&self, scan_id: Uuid) -> Result<()> {
        self.db
            .remove(Self::key(scan_id).as_bytes())
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        Ok(())
    }

    /// All registered scans, newest first. Corrupt entries are skipped with
    /// a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<ActiveScanInfo>> {
        let mut scans = Vec::new();
        for entry in self.db.scan_prefix(SCAN_PREFIX.as_bytes()) {
            let (key, raw) = entry.map_err(|e| EngineError::Registry(e.to_string()))?;
            match serde_json::from_slice::<ActiveScanInfo>(&raw) {
                Ok(info) => scans.push(info),
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping corrupt registry entry"
                    );
                }
            }
        }
        scans.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(scans)
    }

    /// Registered scans still marked running.
    pub fn list_running(&self) -> Result<Vec<ActiveScanInfo>> {
        Ok(self.list()?.into_iter().filter(|s| s.running).collect())
    }
}
