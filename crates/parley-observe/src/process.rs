use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Resource usage of the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    pub rss_mb: f64,
    pub virtual_mb: f64,
    pub cpu_percent: f32,
}

/// Samples memory and CPU for this process.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// always reports zero.
pub struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("process metrics unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    pub fn sample(&mut self) -> ProcessStats {
        let Some(pid) = self.pid else {
            return ProcessStats::default();
        };

        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match self.system.process(pid) {
            Some(process) => ProcessStats {
                rss_mb: bytes_to_mb(process.memory()),
                virtual_mb: bytes_to_mb(process.virtual_memory()),
                cpu_percent: process.cpu_usage(),
            },
            None => ProcessStats::default(),
        }
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
