//! Resource limit enforcement for governed processes
//!
//! Wraps one running subprocess and enforces:
//! - CPU usage (kill threshold, consecutive samples)
//! - Memory usage (kill threshold, consecutive samples)
//! - Wall-clock execution time (warning timer, kill timer)
//!
//! Termination escalates from SIGTERM to SIGKILL after a grace period.
//!
//! ```text
//! start ──┬── check tick ──▶ ProcessMonitor::check_process ──▶ ViolationTracker
//!         ├── warning timer (warning_ratio × timeout) ──▶ warnings[]
//!         ├── kill timer (timeout) ──▶ terminate
//!         └── process exit ──▶ ResourceLimitResult
//! ```

use crate::runtime::process_manager::{ExitOutcome, ProcessHandle};
use crate::telemetry::monitor::ProcessMonitor;
use crate::telemetry::sample::ResourceSample;
use crate::utils::errors::{GovernorError, ViolationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reason recorded when the kill timer fires
pub const EXECUTION_TIMEOUT_REASON: &str = "Execution timeout exceeded";

/// Resource limits for a governed process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU percentage that lowers the health score (advisory)
    pub cpu_warn_percent: f64,

    /// Memory percentage that lowers the health score (advisory)
    pub mem_warn_percent: f64,

    /// CPU percentage that counts as a violation
    pub cpu_kill_percent: f64,

    /// Memory percentage that counts as a violation
    pub mem_kill_percent: f64,

    /// Consecutive violations before termination
    pub violation_threshold: u32,

    /// Check loop interval in milliseconds (default: 5s)
    pub check_interval_ms: u64,

    /// Wall-clock budget in milliseconds (default: 5min)
    pub execution_timeout_ms: u64,

    /// Fraction of the timeout at which a warning is recorded
    pub warning_ratio: f64,

    /// Time between SIGTERM and SIGKILL in milliseconds (default: 5s)
    pub grace_period_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_warn_percent: 80.0,
            mem_warn_percent: 80.0,
            cpu_kill_percent: 95.0,
            mem_kill_percent: 90.0,
            violation_threshold: 3,
            check_interval_ms: 5_000,
            execution_timeout_ms: 300_000,
            warning_ratio: 0.8,
            grace_period_ms: 5_000,
        }
    }
}

impl ResourceLimits {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn warning_after(&self) -> Duration {
        self.execution_timeout().mul_f64(self.warning_ratio)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("CPU warn", self.cpu_warn_percent),
            ("Memory warn", self.mem_warn_percent),
            ("CPU kill", self.cpu_kill_percent),
            ("Memory kill", self.mem_kill_percent),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(format!("{} threshold must be positive", name));
            }
        }

        // CPU may exceed 100% on multi-core machines; memory cannot
        if self.mem_kill_percent > 100.0 {
            return Err("Memory kill threshold cannot exceed 100%".to_string());
        }

        if self.cpu_kill_percent <= self.cpu_warn_percent {
            return Err("CPU kill threshold must be above the warn threshold".to_string());
        }
        if self.mem_kill_percent <= self.mem_warn_percent {
            return Err("Memory kill threshold must be above the warn threshold".to_string());
        }

        if self.violation_threshold == 0 {
            return Err("Violation threshold cannot be 0".to_string());
        }
        if self.check_interval_ms == 0 {
            return Err("Check interval cannot be 0".to_string());
        }
        if self.execution_timeout_ms == 0 {
            return Err("Execution timeout cannot be 0".to_string());
        }
        if self.warning_ratio.is_nan() || self.warning_ratio <= 0.0 || self.warning_ratio >= 1.0 {
            return Err("Warning ratio must be between 0 and 1".to_string());
        }

        Ok(())
    }
}

/// One recorded limit violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub value: f64,
    pub threshold: f64,

    /// Consecutive count including this one
    pub consecutive: u32,
    pub at: DateTime<Utc>,
}

/// Per-process consecutive violation counters
///
/// Lives for the whole enforcement of one process; counters carry over
/// between checks and reset only on an in-range sample.
#[derive(Debug, Clone)]
pub struct ViolationTracker {
    cpu_kill: f64,
    mem_kill: f64,
    threshold: u32,
    cpu: u32,
    memory: u32,
}

impl ViolationTracker {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            cpu_kill: limits.cpu_kill_percent,
            mem_kill: limits.mem_kill_percent,
            threshold: limits.violation_threshold,
            cpu: 0,
            memory: 0,
        }
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu
    }

    pub fn memory_count(&self) -> u32 {
        self.memory
    }

    /// Feed one sample. Returns the violations it produced and, once a
    /// counter reaches the threshold, the kind that warrants termination.
    pub fn observe(&mut self, sample: &ResourceSample) -> (Vec<Violation>, Option<ViolationKind>) {
        let now = Utc::now();
        let mut violations = Vec::new();
        let mut terminate = None;

        if sample.cpu_percent > self.cpu_kill {
            self.cpu += 1;
            violations.push(Violation {
                kind: ViolationKind::Cpu,
                value: sample.cpu_percent,
                threshold: self.cpu_kill,
                consecutive: self.cpu,
                at: now,
            });
            if self.cpu >= self.threshold {
                terminate = Some(ViolationKind::Cpu);
            }
        } else {
            self.cpu = 0;
        }

        if sample.mem_percent > self.mem_kill {
            self.memory += 1;
            violations.push(Violation {
                kind: ViolationKind::Memory,
                value: sample.mem_percent,
                threshold: self.mem_kill,
                consecutive: self.memory,
                at: now,
            });
            if self.memory >= self.threshold && terminate.is_none() {
                terminate = Some(ViolationKind::Memory);
            }
        } else {
            self.memory = 0;
        }

        // Recorded only; a zombie has already exited and is waiting to be reaped
        if sample.is_zombie() {
            violations.push(Violation {
                kind: ViolationKind::Zombie,
                value: 0.0,
                threshold: 0.0,
                consecutive: 1,
                at: now,
            });
        }

        (violations, terminate)
    }
}

/// Why the enforcer ended a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "kind")]
pub enum Termination {
    Timeout,
    Violation(ViolationKind),
}

/// Outcome of one enforced process
#[derive(Debug, Clone, Serialize)]
pub struct ResourceLimitResult {
    pub name: String,

    pub pid: Option<u32>,

    /// True only if the enforcer did not force termination and the exit code is 0
    pub success: bool,

    pub exit_code: Option<i32>,

    pub signal: Option<i32>,

    pub termination: Option<Termination>,

    pub termination_reason: Option<String>,

    pub final_resource_usage: Option<ResourceSample>,

    pub violations: Vec<Violation>,

    pub warnings: Vec<String>,

    pub duration_ms: u64,
}

impl ResourceLimitResult {
    fn without_pid(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            success: false,
            exit_code: None,
            signal: None,
            termination: None,
            termination_reason: Some(format!("Process '{}' has no PID; it may have failed to start", name)),
            final_resource_usage: None,
            violations: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Typed error for a forced termination
    pub fn error(&self) -> Option<GovernorError> {
        self.termination.map(|termination| match termination {
            Termination::Timeout => GovernorError::ExecutionTimeoutExceeded,
            Termination::Violation(kind) => GovernorError::ResourceViolation(kind),
        })
    }
}

/// Resource limiter enforcing limits on one process at a time
#[derive(Clone)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
    monitor: ProcessMonitor,
}

impl ResourceLimiter {
    /// The monitor scores health against this limiter's warn thresholds
    pub fn new(limits: ResourceLimits, monitor: ProcessMonitor) -> Self {
        let monitor = monitor.with_warn_thresholds(limits.cpu_warn_percent, limits.mem_warn_percent);
        Self { limits, monitor }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.monitor
    }

    /// Enforce limits on `handle` until it exits or is terminated
    pub async fn wrap_process(&self, handle: &ProcessHandle, name: &str) -> ResourceLimitResult {
        let Some(pid) = handle.pid() else {
            warn!("Cannot enforce limits on '{}': no PID", name);
            return ResourceLimitResult::without_pid(name);
        };

        let started = Instant::now();
        let limits = &self.limits;
        // Another caller may already be polling this pid; leave its poller alone
        let owns_monitoring = self.monitor.start_monitoring(pid);
        debug!(
            "Enforcing limits on '{}' (PID {}): timeout {:?}, check every {:?}",
            name,
            pid,
            limits.execution_timeout(),
            limits.check_interval()
        );

        let mut tracker = ViolationTracker::new(limits);
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let mut last_sample: Option<ResourceSample> = None;

        let mut ticker = tokio::time::interval_at(started + limits.check_interval(), limits.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let warning_timer = tokio::time::sleep_until(started + limits.warning_after());
        let kill_timer = tokio::time::sleep_until(started + limits.execution_timeout());
        tokio::pin!(warning_timer);
        tokio::pin!(kill_timer);
        let mut warned = false;

        let (outcome, termination, reason): (ExitOutcome, Option<Termination>, Option<String>) = loop {
            tokio::select! {
                biased;

                outcome = handle.wait() => {
                    break (outcome, None, None);
                }

                _ = &mut kill_timer => {
                    warn!("'{}' (PID {}) exceeded its execution timeout of {:?}", name, pid, limits.execution_timeout());
                    let outcome = handle.terminate(limits.grace_period()).await;
                    break (outcome, Some(Termination::Timeout), Some(EXECUTION_TIMEOUT_REASON.to_string()));
                }

                _ = &mut warning_timer, if !warned => {
                    warned = true;
                    let message = format!(
                        "'{}' has used {:.0}% of its {}s execution timeout",
                        name,
                        limits.warning_ratio * 100.0,
                        limits.execution_timeout().as_secs()
                    );
                    warn!("{}", message);
                    warnings.push(message);
                }

                _ = ticker.tick() => {
                    let report = match self.monitor.check_process(pid).await {
                        Ok(report) => report,
                        Err(e) => {
                            warn!("Resource check failed for '{}' (PID {}): {}", name, pid, e);
                            continue;
                        }
                    };
                    let Some(sample) = report.sample else {
                        // Gone; the exit branch picks it up
                        continue;
                    };

                    debug!(
                        "'{}' (PID {}): cpu {:.1}% mem {:.1}% health {}",
                        name, pid, sample.cpu_percent, sample.mem_percent, report.health.health_score
                    );

                    let (new_violations, terminate) = tracker.observe(&sample);
                    for violation in &new_violations {
                        metrics::counter!("procgov_violations_total", "kind" => violation.kind.to_string()).increment(1);
                    }
                    violations.extend(new_violations);
                    last_sample = Some(sample.clone());

                    if let Some(kind) = terminate {
                        let (value, threshold) = match kind {
                            ViolationKind::Memory => (sample.mem_percent, limits.mem_kill_percent),
                            _ => (sample.cpu_percent, limits.cpu_kill_percent),
                        };
                        let reason = format!(
                            "{} usage {:.1}% exceeded kill threshold {:.0}% for {} consecutive checks",
                            kind, value, threshold, limits.violation_threshold
                        );
                        warn!("Terminating '{}' (PID {}): {}", name, pid, reason);
                        let outcome = handle.terminate(limits.grace_period()).await;
                        break (outcome, Some(Termination::Violation(kind)), Some(reason));
                    }
                }
            }
        };

        let final_resource_usage = if owns_monitoring {
            self.monitor.stop_monitoring(pid)
        } else {
            self.monitor.latest(pid)
        }
        .or(last_sample);
        let elapsed = started.elapsed();

        if let Some(termination) = &termination {
            let label = match termination {
                Termination::Timeout => "timeout".to_string(),
                Termination::Violation(kind) => kind.to_string(),
            };
            metrics::counter!("procgov_terminations_total", "reason" => label).increment(1);
        }

        let termination_reason = reason.or_else(|| outcome.error.clone());
        let success = termination.is_none() && outcome.code == Some(0);
        info!(
            "'{}' (PID {}) finished in {:?}: exit {:?}, success {}",
            name, pid, elapsed, outcome.code, success
        );

        ResourceLimitResult {
            name: name.to_string(),
            pid: Some(pid),
            success,
            exit_code: outcome.code,
            signal: outcome.signal,
            termination,
            termination_reason,
            final_resource_usage,
            violations,
            warnings,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}
