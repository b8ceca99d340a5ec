//! Process memory sampling for scan metrics.

use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, System};

/// Samples this process's resident set size. Refreshing mutates the
/// underlying [`System`], so the probe serializes access internally.
#[derive(Debug)]
pub struct MemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Current RSS in bytes, or 0 when the process cannot be sampled.
    pub fn rss_bytes(&self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
