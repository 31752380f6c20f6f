//! Resource samples captured from the OS

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler state of a process, as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Dead,
    Idle,
    Other,
}

impl ProcessState {
    /// Parse the state character from `/proc/<pid>/stat`
    ///
    /// Only the first character matters; trailing modifier flags (`Ss+`, `Z+`)
    /// are ignored.
    pub fn from_code(code: &str) -> Option<Self> {
        let first = code.trim().chars().next()?;
        Some(match first {
            'R' => ProcessState::Running,
            'S' => ProcessState::Sleeping,
            'D' | 'U' => ProcessState::DiskSleep,
            'T' | 't' => ProcessState::Stopped,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Dead,
            'I' => ProcessState::Idle,
            _ => ProcessState::Other,
        })
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self, ProcessState::Zombie | ProcessState::Dead)
    }
}

/// A single resource usage observation for one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub pid: u32,

    /// CPU usage in percent of one core
    pub cpu_percent: f64,

    /// Resident memory as percent of total physical memory
    pub mem_percent: f64,

    /// Resident set size in KiB
    pub rss_kb: u64,

    /// Virtual size in KiB
    pub vsz_kb: u64,

    /// `None` for minimal samples where detailed parsing failed
    pub state: Option<ProcessState>,

    pub ppid: Option<u32>,

    pub command: Option<String>,

    pub captured_at: DateTime<Utc>,
}

impl ResourceSample {
    /// Build a CPU/memory-only sample
    pub fn minimal(pid: u32, cpu_percent: f64, mem_percent: f64) -> Self {
        Self {
            pid,
            cpu_percent,
            mem_percent,
            rss_kb: 0,
            vsz_kb: 0,
            state: None,
            ppid: None,
            command: None,
            captured_at: Utc::now(),
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state.map(|s| s.is_zombie()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(ProcessState::from_code("R"), Some(ProcessState::Running));
        assert_eq!(ProcessState::from_code("Ss+"), Some(ProcessState::Sleeping));
        assert_eq!(ProcessState::from_code("Z+"), Some(ProcessState::Zombie));
        assert_eq!(ProcessState::from_code("?"), Some(ProcessState::Other));
        assert_eq!(ProcessState::from_code(""), None);
    }

    #[test]
    fn test_minimal_sample_has_no_state() {
        let sample = ResourceSample::minimal(42, 1.5, 0.3);
        assert!(sample.state.is_none());
        assert!(!sample.is_zombie());
        assert_eq!(sample.pid, 42);
    }
}
