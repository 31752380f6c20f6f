//! Native `/proc` statistics provider (Linux)

use crate::telemetry::provider::ProcessStatsProvider;
use crate::telemetry::sample::{ProcessState, ResourceSample};
use crate::utils::errors::{GovernorError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace};

/// Fields we need from `/proc/<pid>/stat`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatFields {
    pub pid: u32,
    pub comm: String,
    pub state: Option<ProcessState>,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub start_ticks: u64,
    pub vsize_bytes: u64,
    pub rss_pages: u64,
}

/// Parse a `/proc/<pid>/stat` line
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the split happens on the last `)`.
pub(crate) fn parse_stat(content: &str) -> Option<StatFields> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let comm = content.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();

    // Indices are field number minus 3 (fields 1 and 2 are pid and comm)
    if rest.len() < 22 {
        return None;
    }

    Some(StatFields {
        pid,
        comm,
        state: ProcessState::from_code(rest[0]),
        ppid: rest[1].parse().ok()?,
        utime: rest[11].parse().ok()?,
        stime: rest[12].parse().ok()?,
        start_ticks: rest[19].parse().ok()?,
        vsize_bytes: rest[20].parse().ok()?,
        rss_pages: rest[21].parse::<i64>().ok()?.max(0) as u64,
    })
}

/// Resident pages from `/proc/<pid>/statm`
pub(crate) fn parse_statm_resident(content: &str) -> Option<u64> {
    content.split_whitespace().nth(1)?.parse().ok()
}

/// `MemTotal` in KiB from `/proc/meminfo`
pub(crate) fn parse_mem_total_kb(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// System uptime in seconds from `/proc/uptime`
pub(crate) fn parse_uptime_secs(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

#[derive(Debug, Clone, Copy)]
struct CpuCheckpoint {
    /// Distinguishes a reused pid from the process we sampled before
    start_ticks: u64,
    total_ticks: u64,
    at: Instant,
}

/// `/proc` reader
pub struct ProcfsProvider {
    root: PathBuf,
    clock_ticks: f64,
    page_size_kb: u64,
    /// Last CPU tick count per pid, for delta-based CPU%
    checkpoints: Mutex<HashMap<u32, CpuCheckpoint>>,
}

impl ProcfsProvider {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative procfs mount
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        // SAFETY: sysconf has no preconditions and only reads configuration
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        Self {
            root: root.as_ref().to_path_buf(),
            clock_ticks: if ticks > 0 { ticks as f64 } else { 100.0 },
            page_size_kb: if page_size > 0 { page_size as u64 / 1024 } else { 4 },
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    fn read(&self, relative: impl AsRef<Path>) -> std::io::Result<String> {
        fs::read_to_string(self.root.join(relative))
    }

    fn mem_total_kb(&self) -> Option<u64> {
        self.read("meminfo").ok().as_deref().and_then(parse_mem_total_kb)
    }

    fn uptime_secs(&self) -> Option<f64> {
        self.read("uptime").ok().as_deref().and_then(parse_uptime_secs)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        let raw = self.read(format!("{}/cmdline", pid)).ok()?;
        let joined = raw.replace('\0', " ").trim().to_string();
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    fn mem_percent(&self, rss_kb: u64) -> f64 {
        match self.mem_total_kb() {
            Some(total) if total > 0 => rss_kb as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    fn cpu_percent(&self, stat: &StatFields, track: bool) -> f64 {
        let total_ticks = stat.utime + stat.stime;
        let now = Instant::now();

        if track {
            let mut checkpoints = self.checkpoints.lock();
            let previous = checkpoints.insert(
                stat.pid,
                CpuCheckpoint {
                    start_ticks: stat.start_ticks,
                    total_ticks,
                    at: now,
                },
            );
            if let Some(previous) = previous.filter(|p| p.start_ticks == stat.start_ticks) {
                let elapsed = now.duration_since(previous.at).as_secs_f64();
                if elapsed > 0.0 && total_ticks >= previous.total_ticks {
                    let used = (total_ticks - previous.total_ticks) as f64 / self.clock_ticks;
                    return used / elapsed * 100.0;
                }
            }
        }

        // Lifetime average, the same figure `ps` reports
        let Some(uptime) = self.uptime_secs() else {
            return 0.0;
        };
        let lifetime = uptime - stat.start_ticks as f64 / self.clock_ticks;
        if lifetime <= 0.0 {
            return 0.0;
        }
        total_ticks as f64 / self.clock_ticks / lifetime * 100.0
    }

    /// Degraded sample when `stat` could not be parsed
    fn minimal_sample(&self, pid: u32) -> ResourceSample {
        let mem_percent = self
            .read(format!("{}/statm", pid))
            .ok()
            .as_deref()
            .and_then(parse_statm_resident)
            .map(|pages| self.mem_percent(pages * self.page_size_kb))
            .unwrap_or(0.0);
        ResourceSample::minimal(pid, 0.0, mem_percent)
    }

    fn sample_inner(&self, pid: u32, track: bool) -> Result<Option<ResourceSample>> {
        let content = match self.read(format!("{}/stat", pid)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.checkpoints.lock().remove(&pid);
                return Ok(None);
            }
            Err(e) => {
                return Err(GovernorError::TelemetryError(format!(
                    "Failed to read stat for PID {}: {}",
                    pid, e
                )))
            }
        };

        let Some(stat) = parse_stat(&content) else {
            debug!("Unparseable stat for PID {}, using minimal sample", pid);
            return Ok(Some(self.minimal_sample(pid)));
        };

        let rss_kb = stat.rss_pages * self.page_size_kb;
        let sample = ResourceSample {
            pid,
            cpu_percent: self.cpu_percent(&stat, track),
            mem_percent: self.mem_percent(rss_kb),
            rss_kb,
            vsz_kb: stat.vsize_bytes / 1024,
            state: stat.state,
            ppid: Some(stat.ppid),
            command: self.command_line(pid).or_else(|| Some(stat.comm.clone())),
            captured_at: Utc::now(),
        };

        trace!(
            "PID {}: cpu={:.1}% mem={:.1}%",
            pid,
            sample.cpu_percent,
            sample.mem_percent
        );
        Ok(Some(sample))
    }
}

impl Default for ProcfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessStatsProvider for ProcfsProvider {
    fn sample(&self, pid: u32) -> Result<Option<ResourceSample>> {
        self.sample_inner(pid, true)
    }

    fn list_all(&self) -> Result<Vec<ResourceSample>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            GovernorError::TelemetryError(format!("Failed to list {:?}: {}", self.root, e))
        })?;

        let mut samples = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes vanish mid-scan, that is not an error
            if let Ok(Some(sample)) = self.sample_inner(pid, false) {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    fn forget(&self, pid: u32) {
        self.checkpoints.lock().remove(&pid);
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}
