//! Governor facade
//!
//! Wires the components together for the common flow:
//!
//! ```text
//! reserve_slot ──▶ spawn ──▶ register_process ──▶ wrap_process ──▶ GovernedRun
//!      │             │ (fails: reservation cancelled)
//!      └─ retried while admission is denied
//! ```
//!
//! One `Governor` per application; share it by `Arc`.

use crate::retry::circuit::{CircuitBreakerRegistry, CircuitError};
use crate::retry::coordinator::{RetryCoordinator, RetryOptions};
use crate::runtime::admission::AdmissionController;
use crate::runtime::process_manager::{OutputStream, ProcessKind, ProcessManager, SpawnConfig};
use crate::runtime::resource_limiter::{ResourceLimitResult, ResourceLimiter};
use crate::telemetry::monitor::ProcessMonitor;
use crate::utils::config::GovernorConfig;
use crate::utils::errors::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Output lines kept from a governed process
const OUTPUT_TAIL_LINES: usize = 50;

/// How long to wait for stdio to drain after exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of one governed run
#[derive(Debug, Clone, Serialize)]
pub struct GovernedRun {
    pub id: String,
    pub kind: ProcessKind,
    pub component: String,

    /// Attempts needed to obtain a slot
    pub admission_attempts: u32,

    pub result: ResourceLimitResult,

    /// Last lines of combined stdout/stderr, stderr prefixed with `!`
    pub output_tail: Vec<String>,

    /// Lines lost because the output buffer filled faster than it drained
    pub dropped_output_lines: u64,
}

/// Governance core wired from one configuration
pub struct Governor {
    config: GovernorConfig,
    admission: Arc<AdmissionController>,
    limiter: ResourceLimiter,
    process_manager: ProcessManager,
    retry: RetryCoordinator,
    breakers: CircuitBreakerRegistry,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Result<Self> {
        let monitor = ProcessMonitor::new(config.monitor.clone());
        Self::with_monitor(config, monitor)
    }

    /// Build around an existing monitor, e.g. one with a custom stats provider
    pub fn with_monitor(config: GovernorConfig, monitor: ProcessMonitor) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            admission: Arc::new(AdmissionController::new(config.admission.clone())),
            limiter: ResourceLimiter::new(config.limits.clone(), monitor),
            process_manager: ProcessManager::new(),
            retry: RetryCoordinator::new(),
            breakers: CircuitBreakerRegistry::new(config.circuit.clone()),
            config,
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        self.limiter.monitor()
    }

    pub fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Reserve, spawn, register, and enforce one process
    ///
    /// With `retry_options`, denied reservations are retried per those
    /// options; otherwise a denial is returned immediately.
    pub async fn run(
        &self,
        spawn: &SpawnConfig,
        component: &str,
        retry_options: Option<RetryOptions>,
    ) -> Result<GovernedRun> {
        let kind = spawn.kind;

        let (reservation, admission_attempts) = match retry_options {
            Some(options) => {
                let result = self
                    .retry
                    .with_retry(
                        || {
                            let reserved = self.admission.reserve_slot(kind, component, None);
                            async move { reserved }
                        },
                        options,
                    )
                    .await;
                let attempts = result.attempts;
                (result.into_result()?, attempts)
            }
            None => (self.admission.reserve_slot(kind, component, None)?, 1),
        };

        // One breaker per program: stop hammering a binary that will not start
        let breaker = self.breakers.get(&spawn.program);
        let spawned = breaker.execute(|| async { self.process_manager.spawn(spawn) }).await;
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.admission.cancel_reservation(&reservation);
                return Err(match e {
                    CircuitError::Operation(e) => e,
                    open => open.into_governor_error(),
                });
            }
        };

        let process = match self.admission.register_process(&reservation, handle.clone(), None) {
            Ok(process) => process,
            Err(e) => {
                handle.force_kill();
                return Err(e);
            }
        };

        let output = handle.take_output();
        let tail = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
            if let Some(mut output) = output {
                while let Some(line) = output.recv().await {
                    if tail.len() == OUTPUT_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(match line.stream {
                        OutputStream::Stdout => line.line,
                        OutputStream::Stderr => format!("!{}", line.line),
                    });
                }
            }
            tail
        });

        let name = format!("{} ({})", component, process.id);
        let result = self.limiter.wrap_process(&handle, &name).await;

        let output_tail = match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, tail).await {
            Ok(Ok(tail)) => tail.into_iter().collect(),
            Ok(Err(e)) => {
                debug!("Output collector for {} failed: {}", process.id, e);
                Vec::new()
            }
            Err(_) => {
                // A grandchild still holds the pipes open
                debug!("Output for {} did not drain within {:?}", process.id, OUTPUT_DRAIN_TIMEOUT);
                Vec::new()
            }
        };

        info!(
            "Governed run {} finished: success {}, exit {:?}",
            process.id, result.success, result.exit_code
        );

        Ok(GovernedRun {
            id: process.id,
            kind,
            component: component.to_string(),
            admission_attempts,
            result,
            output_tail,
            dropped_output_lines: handle.dropped_output_lines(),
        })
    }

    /// Kill everything this governor is tracking
    pub fn shutdown(&self, reason: &str) -> usize {
        self.admission.emergency_shutdown(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::admission::{AdmissionConfig, ProcessLimits};
    use crate::runtime::resource_limiter::ResourceLimits;
    use crate::utils::errors::GovernorError;

    fn config(max_total: usize) -> GovernorConfig {
        GovernorConfig {
            admission: AdmissionConfig {
                limits: ProcessLimits {
                    max_total,
                    warning_threshold: max_total,
                    ..Default::default()
                },
                ..Default::default()
            },
            limits: ResourceLimits {
                check_interval_ms: 100,
                execution_timeout_ms: 5_000,
                grace_period_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_collects_output_and_releases_slot() {
        let governor = Governor::new(config(12)).unwrap();
        let spawn = SpawnConfig::new(ProcessKind::TestRunnerB, "sh").args(["-c", "echo out; echo err >&2"]);

        let run = governor.run(&spawn, "pytest", None).await.unwrap();
        assert!(run.result.success);
        assert_eq!(run.admission_attempts, 1);
        assert!(run.output_tail.contains(&"out".to_string()));
        assert!(run.output_tail.contains(&"!err".to_string()));
        assert_eq!(run.dropped_output_lines, 0);

        // Lifecycle listener releases the slot after exit
        for _ in 0..50 {
            if governor.admission().active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(governor.admission().active_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_cancels_reservation() {
        let governor = Governor::new(config(12)).unwrap();
        let spawn = SpawnConfig::new(ProcessKind::Other, "definitely-not-a-binary-xyz");

        let err = governor.run(&spawn, "broken", None).await.unwrap_err();
        assert!(matches!(err, GovernorError::ProcessSpawnFailed(_)));
        assert_eq!(governor.admission().reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_without_retry() {
        let governor = Governor::new(config(1)).unwrap();
        governor
            .admission()
            .reserve_slot(ProcessKind::Other, "holder", None)
            .unwrap();

        let spawn = SpawnConfig::new(ProcessKind::Other, "true");
        let err = governor.run(&spawn, "second", None).await.unwrap_err();
        assert!(err.to_string().contains("Total process limit exceeded: 1/1"));
    }

    #[test]
    fn test_health_scoring_uses_configured_warn_levels() {
        let mut config = config(12);
        config.limits.cpu_warn_percent = 20.0;
        config.limits.mem_warn_percent = 35.0;

        let governor = Governor::new(config).unwrap();
        assert_eq!(governor.monitor().thresholds().cpu_warn_percent, 20.0);
        assert_eq!(governor.monitor().thresholds().mem_warn_percent, 35.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(12);
        bad.limits.violation_threshold = 0;
        assert!(Governor::new(bad).is_err());
    }
}
