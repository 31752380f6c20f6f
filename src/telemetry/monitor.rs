//! Periodic process monitor with bounded per-pid history

use crate::telemetry::health::{analyze_health, HealthMetrics, HealthThresholds};
use crate::telemetry::provider::{default_provider, ProcessStatsProvider};
use crate::telemetry::sample::ResourceSample;
use crate::utils::errors::{GovernorError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Background poll interval in milliseconds (default: 30s)
    pub poll_interval_ms: u64,

    /// Samples kept per pid (default: 100)
    pub history_limit: usize,

    /// Consecutive "process gone" samples before polling stops
    pub max_missed_samples: u32,

    /// Percentage points of increase across the trend window that count as a trend
    pub trend_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            history_limit: 100,
            max_missed_samples: 1,
            trend_threshold: HealthThresholds::default().trend_threshold,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("Monitor poll interval cannot be 0".to_string());
        }
        if self.history_limit == 0 {
            return Err("Monitor history limit cannot be 0".to_string());
        }
        if self.max_missed_samples == 0 {
            return Err("Monitor max missed samples cannot be 0".to_string());
        }
        if self.trend_threshold.is_nan() || self.trend_threshold < 0.0 {
            return Err("Monitor trend threshold cannot be negative".to_string());
        }
        Ok(())
    }
}

/// Latest sample plus its derived health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `None` when the process no longer exists
    pub sample: Option<ResourceSample>,
    pub health: HealthMetrics,
}

/// Process monitor
///
/// Cheap to clone; clones share history and pollers.
#[derive(Clone)]
pub struct ProcessMonitor {
    provider: Arc<dyn ProcessStatsProvider>,
    config: MonitorConfig,
    thresholds: HealthThresholds,
    history: Arc<DashMap<u32, VecDeque<ResourceSample>>>,
    pollers: Arc<DashMap<u32, CancellationToken>>,
}

impl ProcessMonitor {
    /// Monitor backed by the platform's default provider
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_provider(config, default_provider())
    }

    pub fn with_provider(config: MonitorConfig, provider: Arc<dyn ProcessStatsProvider>) -> Self {
        debug!("Process monitor using {} provider", provider.name());
        let thresholds = HealthThresholds {
            trend_threshold: config.trend_threshold,
            ..Default::default()
        };
        Self {
            provider,
            config,
            thresholds,
            history: Arc::new(DashMap::new()),
            pollers: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Use these warn levels when scoring health
    ///
    /// The returned monitor still shares history and pollers with `self`.
    pub fn with_warn_thresholds(mut self, cpu_warn_percent: f64, mem_warn_percent: f64) -> Self {
        self.thresholds.cpu_warn_percent = cpu_warn_percent;
        self.thresholds.mem_warn_percent = mem_warn_percent;
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Start background polling for a pid. Returns `false` if already polling.
    pub fn start_monitoring(&self, pid: u32) -> bool {
        let token = CancellationToken::new();
        match self.pollers.entry(pid) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        debug!("Starting monitoring for PID {}", pid);
        metrics::gauge!("procgov_monitored_processes").increment(1.0);

        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.poll_loop(pid, token).await;
        });
        true
    }

    async fn poll_loop(&self, pid: u32, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut missed = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.try_capture(pid).await {
                        Ok(Some(sample)) => {
                            missed = 0;
                            self.record(sample);
                        }
                        Ok(None) => {
                            missed += 1;
                            if missed >= self.config.max_missed_samples {
                                debug!("PID {} is gone, stopping monitoring", pid);
                                self.stop_monitoring(pid);
                                break;
                            }
                        }
                        Err(e) => {
                            // Skip this cycle
                            warn!("Resource capture failed for PID {}: {}", pid, e);
                        }
                    }
                }
            }
        }
    }

    /// Stop polling a pid and drop its history. Returns the last sample seen.
    pub fn stop_monitoring(&self, pid: u32) -> Option<ResourceSample> {
        if let Some((_, token)) = self.pollers.remove(&pid) {
            token.cancel();
            metrics::gauge!("procgov_monitored_processes").decrement(1.0);
            debug!("Stopped monitoring PID {}", pid);
        }
        self.provider.forget(pid);
        self.history
            .remove(&pid)
            .and_then(|(_, mut samples)| samples.pop_back())
    }

    pub fn is_monitoring(&self, pid: u32) -> bool {
        self.pollers.contains_key(&pid)
    }

    pub fn monitored_pids(&self) -> Vec<u32> {
        self.pollers.iter().map(|entry| *entry.key()).collect()
    }

    async fn try_capture(&self, pid: u32) -> Result<Option<ResourceSample>> {
        let provider = Arc::clone(&self.provider);
        tokio::task::spawn_blocking(move || provider.sample(pid))
            .await
            .map_err(|e| GovernorError::TelemetryError(format!("Sampling task failed: {}", e)))?
    }

    /// Capture one sample. `None` if the process is gone or the OS query failed.
    pub async fn capture_resource_usage(&self, pid: u32) -> Option<ResourceSample> {
        match self.try_capture(pid).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Resource capture failed for PID {}: {}", pid, e);
                None
            }
        }
    }

    /// Append a sample to the pid's bounded history
    pub fn record(&self, sample: ResourceSample) {
        let limit = self.config.history_limit;
        let mut history = self.history.entry(sample.pid).or_default();
        history.push_back(sample);
        while history.len() > limit {
            history.pop_front();
        }
    }

    pub fn history(&self, pid: u32) -> Vec<ResourceSample> {
        self.history
            .get(&pid)
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, pid: u32) -> Option<ResourceSample> {
        self.history.get(&pid).and_then(|samples| samples.back().cloned())
    }

    /// Capture a fresh sample, record it, and score it against history
    pub async fn check_process(&self, pid: u32) -> Result<HealthReport> {
        let sample = self.try_capture(pid).await?;
        if let Some(sample) = &sample {
            self.record(sample.clone());
        }
        let history = self.history(pid);
        let health = analyze_health(sample.as_ref(), &history, &self.thresholds);
        Ok(HealthReport { sample, health })
    }

    /// Score the most recent recorded sample without querying the OS
    pub fn analyze_health(&self, pid: u32) -> HealthMetrics {
        let history = self.history(pid);
        analyze_health(history.last(), &history, &self.thresholds)
    }

    /// System-wide scan for zombie or defunct processes
    pub async fn detect_zombie_processes(&self) -> Result<Vec<ResourceSample>> {
        let provider = Arc::clone(&self.provider);
        let all = tokio::task::spawn_blocking(move || provider.list_all())
            .await
            .map_err(|e| GovernorError::TelemetryError(format!("Scan task failed: {}", e)))??;

        let zombies: Vec<ResourceSample> = all.into_iter().filter(|s| s.is_zombie()).collect();
        if !zombies.is_empty() {
            info!("Detected {} zombie process(es)", zombies.len());
        }
        Ok(zombies)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::telemetry::sample::ProcessState;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Provider returning scripted samples per pid
    #[derive(Default)]
    pub(crate) struct ScriptedProvider {
        pub samples: Mutex<HashMap<u32, VecDeque<Option<ResourceSample>>>>,
        pub all: Mutex<Vec<ResourceSample>>,
        pub forgotten: Mutex<Vec<u32>>,
    }

    impl ScriptedProvider {
        pub fn push(&self, pid: u32, sample: Option<ResourceSample>) {
            self.samples.lock().entry(pid).or_default().push_back(sample);
        }
    }

    impl ProcessStatsProvider for ScriptedProvider {
        fn sample(&self, pid: u32) -> Result<Option<ResourceSample>> {
            let mut samples = self.samples.lock();
            let queue = samples.entry(pid).or_default();
            // Repeat the final scripted value once the script runs out
            let next = if queue.len() > 1 {
                queue.pop_front().flatten()
            } else {
                queue.front().cloned().flatten()
            };
            Ok(next)
        }

        fn list_all(&self) -> Result<Vec<ResourceSample>> {
            Ok(self.all.lock().clone())
        }

        fn forget(&self, pid: u32) {
            self.forgotten.lock().push(pid);
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    pub(crate) fn running(pid: u32, cpu: f64, mem: f64) -> ResourceSample {
        ResourceSample {
            state: Some(ProcessState::Running),
            ..ResourceSample::minimal(pid, cpu, mem)
        }
    }

    fn monitor_with(provider: Arc<ScriptedProvider>, history_limit: usize) -> ProcessMonitor {
        let config = MonitorConfig {
            poll_interval_ms: 1_000,
            history_limit,
            ..Default::default()
        };
        ProcessMonitor::with_provider(config, provider)
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let provider = Arc::new(ScriptedProvider::default());
        let monitor = monitor_with(provider, 3);

        for i in 0..5 {
            monitor.record(running(7, i as f64, 1.0));
        }

        let history = monitor.history(7);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cpu_percent, 2.0);
        assert_eq!(monitor.latest(7).unwrap().cpu_percent, 4.0);
    }

    #[tokio::test]
    async fn test_check_process_records_and_scores() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(11, Some(running(11, 95.0, 10.0)));
        let monitor = monitor_with(provider, 10);

        let report = monitor.check_process(11).await.unwrap();
        assert!(report.health.is_alive);
        assert!(report.health.is_high_resource);
        assert_eq!(monitor.history(11).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_process_reports_dead() {
        let provider = Arc::new(ScriptedProvider::default());
        let monitor = monitor_with(provider, 10);

        let report = monitor.check_process(12).await.unwrap();
        assert!(report.sample.is_none());
        assert!(!report.health.is_alive);
        assert!(monitor.capture_resource_usage(12).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(20, Some(running(20, 1.0, 1.0)));
        let monitor = monitor_with(provider, 10);

        assert!(monitor.start_monitoring(20));
        assert!(!monitor.start_monitoring(20));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(monitor.history(20).len() >= 2);

        assert!(monitor.stop_monitoring(20).is_some());
        assert!(monitor.stop_monitoring(20).is_none());
        assert!(!monitor.is_monitoring(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_releases_provider_state() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(21, Some(running(21, 1.0, 1.0)));
        let monitor = monitor_with(Arc::clone(&provider), 10);

        monitor.start_monitoring(21);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        monitor.stop_monitoring(21);

        assert_eq!(*provider.forgotten.lock(), vec![21]);
    }

    #[tokio::test]
    async fn test_warn_thresholds_drive_scoring() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(22, Some(running(22, 30.0, 10.0)));

        let default_monitor = monitor_with(Arc::clone(&provider), 10);
        assert!(!default_monitor.check_process(22).await.unwrap().health.is_high_resource);

        let strict = monitor_with(provider, 10).with_warn_thresholds(20.0, 50.0);
        assert_eq!(strict.thresholds().cpu_warn_percent, 20.0);
        assert_eq!(strict.thresholds().mem_warn_percent, 50.0);
        assert!(strict.check_process(22).await.unwrap().health.is_high_resource);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_when_process_disappears() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(30, Some(running(30, 1.0, 1.0)));
        provider.push(30, None);
        let monitor = monitor_with(provider, 10);

        monitor.start_monitoring(30);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(!monitor.is_monitoring(30));
    }

    #[tokio::test]
    async fn test_detect_zombies() {
        let provider = Arc::new(ScriptedProvider::default());
        let mut zombie = running(41, 0.0, 0.0);
        zombie.state = Some(ProcessState::Zombie);
        *provider.all.lock() = vec![running(40, 1.0, 1.0), zombie];
        let monitor = monitor_with(provider, 10);

        let zombies = monitor.detect_zombie_processes().await.unwrap();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].pid, 41);
    }
}
