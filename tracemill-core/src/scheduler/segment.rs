//! In-order reassembly of segmented transcript results.
//!
//! A transcript split into k segments fans out across tasks, but segment
//! results must reach the recorder in original segment-index order: index i
//! is released only once all segments <= i have resolved, regardless of
//! completion timing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracemill_model::ResultRecord;

use crate::error::{EngineError, Result};

/// Collection barrier for one (scanner, transcript) key.
#[derive(Debug)]
pub struct SegmentCollector {
    pending: BTreeMap<usize, Vec<ResultRecord>>,
    next: usize,
    count: usize,
}

impl SegmentCollector {
    pub fn new(count: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
            count,
        }
    }

    /// Record one segment's results. Returns every row releasable in order:
    /// the contiguous prefix of resolved segments starting at `next`.
    pub fn complete(&mut self, index: usize, rows: Vec<ResultRecord>) -> Vec<ResultRecord> {
        self.pending.insert(index, rows);
        let mut released = Vec::new();
        while let Some(rows) = self.pending.remove(&self.next) {
            released.extend(rows);
            self.next += 1;
        }
        released
    }

    /// True once all segments have been released.
    pub fn is_done(&self) -> bool {
        self.next >= self.count
    }
}

/// Keyed segment barriers for all in-flight segmented transcripts.
#[derive(Debug, Default)]
pub struct SegmentAssembler {
    inner: Mutex<HashMap<(String, String), (SegmentCollector, Vec<ResultRecord>)>>,
}

impl SegmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit one segment's results. Returns the full, segment-ordered row
    /// set once every segment of the key has resolved; `None` while earlier
    /// segments are still outstanding.
    pub fn submit(
        &self,
        scanner: &str,
        transcript: &str,
        index: usize,
        count: usize,
        rows: Vec<ResultRecord>,
    ) -> Result<Option<Vec<ResultRecord>>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("segment assembler poisoned".into()))?;
        let key = (scanner.to_string(), transcript.to_string());
        let (collector, released) = inner
            .entry(key.clone())
            .or_insert_with(|| (SegmentCollector::new(count), Vec::new()));
        let newly_released = collector.complete(index, rows);
        released.extend(newly_released);
        if collector.is_done() {
            match inner.remove(&key) {
                Some((_, released)) => Ok(Some(released)),
                None => Err(EngineError::Internal(
                    "segment entry vanished mid-submit".into(),
                )),
            }
        } else {
            Ok(None)
        }
    }

    /// Keys still waiting on segments, for interruption reporting.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(scanner: &str, transcript: &str, index: usize) -> ResultRecord {
        ResultRecord::value(scanner, transcript, "segment", index as u64)
    }

    #[test]
    fn releases_only_contiguous_prefix() {
        let mut collector = SegmentCollector::new(3);
        assert!(collector.complete(2, vec![row("s", "t", 2)]).is_empty());
        assert!(collector.complete(1, vec![row("s", "t", 1)]).is_empty());
        let released = collector.complete(0, vec![row("s", "t", 0)]);
        assert_eq!(released.len(), 3);
        assert!(collector.is_done());
        let indices: Vec<u64> = released
            .iter()
            .map(|r| r.values[0].value.as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn assembler_returns_full_set_once() {
        let assembler = SegmentAssembler::new();
        assert!(
            assembler
                .submit("s", "t", 1, 2, vec![row("s", "t", 1)])
                .unwrap()
                .is_none()
        );
        let full = assembler
            .submit("s", "t", 0, 2, vec![row("s", "t", 0)])
            .unwrap()
            .expect("all segments resolved");
        let indices: Vec<u64> = full
            .iter()
            .map(|r| r.values[0].value.as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(assembler.outstanding(), 0);
    }
}
