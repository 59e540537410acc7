use nodepm_core::{ProcessId, ProcessStats};
use std::panic::{self, AssertUnwindSafe};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

/// Accounting handle on one process. CPU usage is measured between two
/// consecutive samples, so the first one always reports 0%.
pub struct StatsSampler {
    pid: Pid,
    system: System,
}

impl StatsSampler {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid: Pid::from_u32(pid),
            system: System::new(),
        }
    }

    /// Never fails: a vanished process or a fault in the accounting code
    /// yields a zeroed snapshot.
    pub fn sample(&mut self) -> ProcessStats {
        match panic::catch_unwind(AssertUnwindSafe(|| self.collect())) {
            Ok(stats) => stats.unwrap_or_default(),
            Err(_) => {
                warn!("process accounting for pid {} panicked", self.pid);
                ProcessStats::default()
            }
        }
    }

    fn collect(&mut self) -> Option<ProcessStats> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let process = self.system.process(self.pid)?;
        Some(ProcessStats {
            cpu: f64::from(process.cpu_usage()),
            rss: process.memory(),
            vms: process.virtual_memory(),
            swap: read_swap(self.pid.as_u32()).unwrap_or(0),
        })
    }
}

fn read_swap(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_swap(&status)
}

/// Extract `VmSwap` (reported in kB) from a `/proc/<pid>/status` document
fn parse_swap(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmSwap:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
