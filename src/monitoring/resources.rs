//! Process resource snapshots for the dashboard. Sampled on a cadence, never
//! per request.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub process_memory_bytes: u64,
    pub process_cpu_percent: f32,
    pub system_memory_used_bytes: u64,
    pub system_memory_total_bytes: u64,
}

impl ResourceSnapshot {
    pub fn process_memory_mb(&self) -> f64 {
        self.process_memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

pub struct ResourceSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl std::fmt::Debug for ResourceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSampler").field("pid", &self.pid).finish()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("📊 MONITOR: Current process id unavailable - process metrics disabled");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Current process and system memory plus process CPU. CPU usage is
    /// relative to the previous sample, so the first reading is 0.
    pub fn sample(&self, at: DateTime<Utc>) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_memory();

        let (process_memory_bytes, process_cpu_percent) = self
            .pid
            .filter(|pid| system.refresh_process(*pid))
            .and_then(|pid| system.process(pid))
            .map(|process| (process.memory(), process.cpu_usage()))
            .unwrap_or((0, 0.0));

        ResourceSnapshot {
            timestamp: at,
            process_memory_bytes,
            process_cpu_percent,
            system_memory_used_bytes: system.used_memory(),
            system_memory_total_bytes: system.total_memory(),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_memory() {
        let sampler = ResourceSampler::new();
        let snapshot = sampler.sample(Utc::now());
        assert!(snapshot.system_memory_total_bytes >= snapshot.system_memory_used_bytes);
        assert!(snapshot.process_cpu_percent >= 0.0);
    }
}
