// System/process memory snapshots and the optional NPU utilization
// monitor. The monitor is a best-effort collaborator: clients get an
// availability flag and must not depend on the sample series.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::paths::MonitorConfig;

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct MemoryStatus {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub percent: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct ProcessMemory {
    pub rss: u64,
    pub private: u64,
}

/// System memory snapshot, cached briefly so status polling stays cheap.
pub fn get_memory_status() -> MemoryStatus {
    lazy_static::lazy_static! {
        static ref CACHE: Mutex<(Instant, MemoryStatus)> =
            Mutex::new((Instant::now() - Duration::from_secs(1), MemoryStatus::default()));
    }

    let mut cache = CACHE.lock().unwrap();
    if cache.0.elapsed() < Duration::from_millis(500) {
        return cache.1;
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    let available = sys.available_memory();
    let used = total.saturating_sub(available);
    let status = MemoryStatus {
        total,
        available,
        used,
        percent: if total > 0 {
            ((used as f64 / total as f64) * 100.0) as u32
        } else {
            0
        },
    };

    *cache = (Instant::now(), status);
    status
}

/// Resident set of one process. `private` is only meaningful on platforms
/// that report it; zero elsewhere.
pub fn get_process_memory(pid: Option<u32>) -> ProcessMemory {
    let Some(pid) = pid else {
        return ProcessMemory::default();
    };

    let mut sys = System::new();
    let target = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

    match sys.process(target) {
        Some(process) => ProcessMemory {
            rss: process.memory(),
            private: 0,
        },
        None => ProcessMemory::default(),
    }
}

// --- NPU utilization monitor -------------------------------------------

const HISTORY_CAP: usize = 120;

#[derive(Debug, Clone, Serialize)]
pub struct NpuStatus {
    pub available: bool,
    pub searching: bool,
    pub current: f64,
    pub history: Vec<f64>,
}

struct NpuState {
    available: bool,
    searching: bool,
    current: f64,
    history: VecDeque<f64>,
    running: bool,
}

pub struct NpuMonitor {
    config: MonitorConfig,
    state: Mutex<NpuState>,
}

impl NpuMonitor {
    pub fn new(config: MonitorConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(NpuMonitor {
            config,
            state: Mutex::new(NpuState {
                available: false,
                searching: false,
                current: 0.0,
                history: VecDeque::new(),
                running: false,
            }),
        })
    }

    /// Start sampling if a counter source is configured. Returns the
    /// availability flag (false when no source exists on this platform).
    pub fn start(self: &std::sync::Arc<Self>) -> bool {
        let Some(counter_path) = self.config.counter_path.clone() else {
            return false;
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return state.available;
            }
            state.running = true;
            state.searching = true;
        }

        let monitor = self.clone();
        std::thread::spawn(move || monitor.poll_loop(counter_path));
        self.state.lock().unwrap().available
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.searching = false;
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().unwrap().available
    }

    pub fn is_searching(&self) -> bool {
        self.state.lock().unwrap().searching
    }

    pub fn status(&self) -> NpuStatus {
        let state = self.state.lock().unwrap();
        NpuStatus {
            available: state.available,
            searching: state.searching,
            current: state.current,
            history: state.history.iter().copied().collect(),
        }
    }

    fn poll_loop(&self, counter_path: PathBuf) {
        let poll = Duration::from_secs_f64(self.config.fast_timeout.max(0.2));
        let retry = Duration::from_secs_f64(self.config.retry_interval.max(1.0));

        loop {
            if !self.state.lock().unwrap().running {
                break;
            }

            match std::fs::read_to_string(&counter_path)
                .ok()
                .and_then(|raw| parse_counter_sample(&raw))
            {
                Some(sample) => {
                    let mut state = self.state.lock().unwrap();
                    state.available = true;
                    state.searching = false;
                    state.current = sample;
                    state.history.push_back(sample);
                    while state.history.len() > HISTORY_CAP {
                        state.history.pop_front();
                    }
                    drop(state);
                    std::thread::sleep(poll);
                }
                None => {
                    let mut state = self.state.lock().unwrap();
                    state.available = false;
                    state.searching = self.config.deep_scan;
                    drop(state);
                    if !self.config.deep_scan {
                        break;
                    }
                    std::thread::sleep(retry);
                }
            }
        }
    }
}

/// Parse the newest utilization sample from a counter dump: the last
/// non-empty line, either a bare number or a `label: 12.3%` form.
pub fn parse_counter_sample(raw: &str) -> Option<f64> {
    let line = raw.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    let tail = line.rsplit(&[':', ',', ' '][..]).next().unwrap_or(line);
    let cleaned = tail.trim().trim_end_matches('%').trim_matches('"');
    let value: f64 = cleaned.parse().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_number() {
        assert_eq!(parse_counter_sample("42.5\n"), Some(42.5));
    }

    #[test]
    fn test_parse_labelled_percent() {
        assert_eq!(parse_counter_sample("NPU Utilization: 17.2%\n"), Some(17.2));
    }

    #[test]
    fn test_parse_takes_last_line() {
        assert_eq!(parse_counter_sample("1.0\n2.0\n3.0\n\n"), Some(3.0));
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert_eq!(parse_counter_sample("250"), None);
        assert_eq!(parse_counter_sample("-5"), None);
        assert_eq!(parse_counter_sample("not a number"), None);
    }

    #[test]
    fn test_monitor_without_source_is_inert() {
        let monitor = NpuMonitor::new(MonitorConfig {
            counter_path: None,
            fast_timeout: 0.1,
            deep_scan: false,
            retry_interval: 1.0,
        });
        assert!(!monitor.start());
        assert!(!monitor.is_available());
        assert!(!monitor.is_searching());
    }

    #[test]
    fn test_monitor_reads_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("npu.txt");
        std::fs::write(&counter, "33.0\n").unwrap();

        let monitor = NpuMonitor::new(MonitorConfig {
            counter_path: Some(counter),
            fast_timeout: 0.05,
            deep_scan: false,
            retry_interval: 1.0,
        });
        monitor.start();
        std::thread::sleep(Duration::from_millis(150));

        let status = monitor.status();
        assert!(status.available);
        assert_eq!(status.current, 33.0);
        assert!(!status.history.is_empty());
        monitor.stop();
    }

    #[test]
    fn test_memory_status_sane() {
        let status = get_memory_status();
        assert!(status.total > 0);
        assert!(status.percent <= 100);
    }
}
