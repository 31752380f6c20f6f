//! Health scoring for monitored processes
//!
//! Scoring rules:
//!
//! | Condition                                  | Penalty |
//! |--------------------------------------------|---------|
//! | not alive                                  | score 0 |
//! | zombie                                     | -50     |
//! | CPU above warn threshold                   | -20     |
//! | memory above warn threshold                | -20     |
//! | CPU trend over last 3 samples > threshold  | -10     |
//! | memory trend over last 3 samples > threshold | -10   |
//! | no state, 0% CPU and 0% memory (stale)     | -30     |
//!
//! The score is floored at 0.

use crate::telemetry::sample::ResourceSample;
use serde::{Deserialize, Serialize};

const TREND_WINDOW: usize = 3;

/// Warn-level thresholds used for scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub cpu_warn_percent: f64,
    pub mem_warn_percent: f64,
    /// Percentage points of increase across the trend window
    pub trend_threshold: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_warn_percent: 80.0,
            mem_warn_percent: 80.0,
            trend_threshold: 10.0,
        }
    }
}

/// Derived health of a process at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub is_alive: bool,
    pub is_zombie: bool,
    pub is_high_resource: bool,
    pub health_score: u8,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl HealthMetrics {
    fn dead() -> Self {
        Self {
            is_alive: false,
            is_zombie: false,
            is_high_resource: false,
            health_score: 0,
            warnings: vec!["Process is no longer running".to_string()],
            recommendations: Vec::new(),
        }
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Average of the later half minus average of the earlier half
fn trend(values: &[f64]) -> f64 {
    let split = values.len() / 2;
    average(&values[split..]) - average(&values[..split])
}

/// Score a process from its latest sample and its history
///
/// `history` is expected to already include `current` as its newest entry.
pub fn analyze_health(
    current: Option<&ResourceSample>,
    history: &[ResourceSample],
    thresholds: &HealthThresholds,
) -> HealthMetrics {
    let Some(sample) = current else {
        return HealthMetrics::dead();
    };

    let mut score: i32 = 100;
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    let is_zombie = sample.is_zombie();
    if is_zombie {
        score -= 50;
        warnings.push("Process is in zombie state".to_string());
        recommendations
            .push("Parent should reap the process, or it should be terminated".to_string());
    }

    let high_cpu = sample.cpu_percent > thresholds.cpu_warn_percent;
    if high_cpu {
        score -= 20;
        warnings.push(format!("High CPU usage: {:.1}%", sample.cpu_percent));
        recommendations.push("Check for runaway loops or reduce concurrency".to_string());
    }

    let high_mem = sample.mem_percent > thresholds.mem_warn_percent;
    if high_mem {
        score -= 20;
        warnings.push(format!("High memory usage: {:.1}%", sample.mem_percent));
        recommendations.push("Reduce memory footprint or raise the memory limit".to_string());
    }

    if history.len() >= TREND_WINDOW {
        let recent = &history[history.len() - TREND_WINDOW..];

        let cpu: Vec<f64> = recent.iter().map(|s| s.cpu_percent).collect();
        let cpu_trend = trend(&cpu);
        if cpu_trend > thresholds.trend_threshold {
            score -= 10;
            warnings.push(format!("CPU usage trending upward (+{:.1}%)", cpu_trend));
        }

        let mem: Vec<f64> = recent.iter().map(|s| s.mem_percent).collect();
        let mem_trend = trend(&mem);
        if mem_trend > thresholds.trend_threshold {
            score -= 10;
            warnings.push(format!("Memory usage trending upward (+{:.1}%)", mem_trend));
            recommendations.push("Watch for potential memory leaks".to_string());
        }
    }

    if sample.state.is_none() && sample.cpu_percent == 0.0 && sample.mem_percent == 0.0 {
        score -= 30;
        warnings.push("Process may be unresponsive (no state, no CPU, no memory)".to_string());
        recommendations.push("Verify the process is still making progress".to_string());
    }

    HealthMetrics {
        is_alive: true,
        is_zombie,
        is_high_resource: high_cpu || high_mem,
        health_score: score.max(0) as u8,
        warnings,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::sample::ProcessState;

    fn sample(cpu: f64, mem: f64, state: Option<ProcessState>) -> ResourceSample {
        ResourceSample {
            state,
            ..ResourceSample::minimal(100, cpu, mem)
        }
    }

    #[test]
    fn test_healthy_process_scores_100() {
        let current = sample(5.0, 2.0, Some(ProcessState::Running));
        let health = analyze_health(Some(&current), &[], &HealthThresholds::default());
        assert!(health.is_alive);
        assert_eq!(health.health_score, 100);
        assert!(health.warnings.is_empty());
    }

    #[test]
    fn test_dead_process_scores_zero() {
        let health = analyze_health(None, &[], &HealthThresholds::default());
        assert!(!health.is_alive);
        assert_eq!(health.health_score, 0);
    }

    #[test]
    fn test_zombie_penalty() {
        let current = sample(0.0, 0.0, Some(ProcessState::Zombie));
        let health = analyze_health(Some(&current), &[], &HealthThresholds::default());
        assert!(health.is_zombie);
        assert!(health.health_score <= 50);
    }

    #[test]
    fn test_high_cpu_and_memory() {
        let current = sample(92.3, 85.0, Some(ProcessState::Running));
        let health = analyze_health(Some(&current), &[], &HealthThresholds::default());
        assert!(health.is_high_resource);
        assert_eq!(health.health_score, 60);
        assert!(health.warnings.iter().any(|w| w.contains("92.3%")));
    }

    #[test]
    fn test_upward_trends() {
        let history = vec![
            sample(10.0, 10.0, Some(ProcessState::Running)),
            sample(30.0, 25.0, Some(ProcessState::Running)),
            sample(40.0, 35.0, Some(ProcessState::Running)),
        ];
        let health = analyze_health(history.last(), &history, &HealthThresholds::default());
        // cpu: avg(30,40) - 10 = 25, mem: avg(25,35) - 10 = 20
        assert_eq!(health.health_score, 80);
        assert!(health.warnings.iter().any(|w| w.contains("CPU usage trending upward")));
        assert!(health
            .recommendations
            .iter()
            .any(|r| r.contains("memory leaks")));
    }

    #[test]
    fn test_trend_needs_three_samples() {
        let history = vec![
            sample(10.0, 10.0, Some(ProcessState::Running)),
            sample(60.0, 60.0, Some(ProcessState::Running)),
        ];
        let health = analyze_health(history.last(), &history, &HealthThresholds::default());
        assert_eq!(health.health_score, 100);
    }

    #[test]
    fn test_stale_sample() {
        let current = ResourceSample::minimal(1, 0.0, 0.0);
        let health = analyze_health(Some(&current), &[], &HealthThresholds::default());
        assert_eq!(health.health_score, 70);
        assert!(health.warnings[0].contains("unresponsive"));
    }

    #[test]
    fn test_score_floors_at_zero() {
        let thresholds = HealthThresholds {
            cpu_warn_percent: 0.0,
            mem_warn_percent: 0.0,
            trend_threshold: 0.0,
        };
        let history = vec![
            sample(1.0, 1.0, Some(ProcessState::Zombie)),
            sample(50.0, 50.0, Some(ProcessState::Zombie)),
            sample(90.0, 90.0, Some(ProcessState::Zombie)),
        ];
        let health = analyze_health(history.last(), &history, &thresholds);
        // 100 - 50 - 20 - 20 - 10 - 10 = -10
        assert_eq!(health.health_score, 0);
    }
}
