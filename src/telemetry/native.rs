//! Platform process API provider, backed by `sysinfo`
//!
//! Default on targets without `/proc`. CPU usage is computed by `sysinfo`
//! from the delta between refreshes, so the first sample of a pid reads 0.

use crate::telemetry::provider::ProcessStatsProvider;
use crate::telemetry::sample::{ProcessState, ResourceSample};
use crate::utils::errors::Result;
use chrono::Utc;
use parking_lot::Mutex;
use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, System};
use tracing::trace;

fn state_of(status: ProcessStatus) -> ProcessState {
    match status {
        ProcessStatus::Run => ProcessState::Running,
        ProcessStatus::Sleep => ProcessState::Sleeping,
        ProcessStatus::Idle => ProcessState::Idle,
        ProcessStatus::UninterruptibleDiskSleep => ProcessState::DiskSleep,
        ProcessStatus::Stop | ProcessStatus::Tracing => ProcessState::Stopped,
        ProcessStatus::Zombie => ProcessState::Zombie,
        ProcessStatus::Dead => ProcessState::Dead,
        _ => ProcessState::Other,
    }
}

fn command_of(process: &Process) -> String {
    let args: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    if args.is_empty() {
        process.name().to_string_lossy().into_owned()
    } else {
        args.join(" ")
    }
}

fn to_sample(process: &Process, total_memory: u64) -> ResourceSample {
    let rss_bytes = process.memory();
    let mem_percent = if total_memory > 0 {
        rss_bytes as f64 / total_memory as f64 * 100.0
    } else {
        0.0
    };

    ResourceSample {
        pid: process.pid().as_u32(),
        cpu_percent: f64::from(process.cpu_usage()),
        mem_percent,
        rss_kb: rss_bytes / 1024,
        vsz_kb: process.virtual_memory() / 1024,
        state: Some(state_of(process.status())),
        ppid: process.parent().map(|parent| parent.as_u32()),
        command: Some(command_of(process)),
        captured_at: Utc::now(),
    }
}

/// Provider over the platform process API
pub struct SysinfoProvider {
    system: Mutex<System>,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessStatsProvider for SysinfoProvider {
    fn sample(&self, pid: u32) -> Result<Option<ResourceSample>> {
        let target = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        let sample = system
            .process(target)
            .map(|process| to_sample(process, system.total_memory()));
        if let Some(sample) = &sample {
            trace!(
                "PID {}: cpu={:.1}% mem={:.1}%",
                pid,
                sample.cpu_percent,
                sample.mem_percent
            );
        }
        Ok(sample)
    }

    fn list_all(&self) -> Result<Vec<ResourceSample>> {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let total_memory = system.total_memory();
        Ok(system
            .processes()
            .values()
            .map(|process| to_sample(process, total_memory))
            .collect())
    }

    fn name(&self) -> &'static str {
        "sysinfo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Above the largest pid_max Linux allows
    const NO_SUCH_PID: u32 = 4_194_404;

    #[test]
    fn test_samples_current_process() {
        let provider = SysinfoProvider::new();
        let pid = std::process::id();

        let sample = provider.sample(pid).unwrap().unwrap();
        assert_eq!(sample.pid, pid);
        assert!(sample.rss_kb > 0);
        assert!(sample.mem_percent > 0.0);
        assert!(!sample.is_zombie());
        assert!(sample.command.is_some_and(|c| !c.is_empty()));
    }

    #[test]
    fn test_missing_process_is_none() {
        let provider = SysinfoProvider::new();
        assert!(provider.sample(NO_SUCH_PID).unwrap().is_none());
    }

    #[test]
    fn test_list_all_includes_current_process() {
        let provider = SysinfoProvider::new();
        let all = provider.list_all().unwrap();
        assert!(all.iter().any(|s| s.pid == std::process::id()));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(state_of(ProcessStatus::Zombie), ProcessState::Zombie);
        assert_eq!(state_of(ProcessStatus::Run), ProcessState::Running);
        assert_eq!(state_of(ProcessStatus::Stop), ProcessState::Stopped);
        assert_eq!(state_of(ProcessStatus::Unknown(0)), ProcessState::Other);
    }
}
