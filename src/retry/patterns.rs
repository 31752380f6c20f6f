//! Failure-pattern detector
//!
//! Remembers, per failure category, how often it happened, which retry
//! strategies eventually succeeded, and how long success took. Also keeps a
//! short per-task failure history for the coordinator's context guard.

use crate::retry::classify::FailureCategory;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Per-task failure records kept for the context guard
const TASK_HISTORY_LIMIT: usize = 10;

/// Distinct strategy names remembered per category
const STRATEGY_HISTORY_LIMIT: usize = 10;

/// What is known about one failure category
#[derive(Debug, Clone, Serialize)]
pub struct FailurePattern {
    pub category: FailureCategory,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
    pub successful_strategies: Vec<String>,

    /// Moving average of time from first failure to success
    pub avg_time_to_success: Option<Duration>,
}

impl FailurePattern {
    fn new(category: FailureCategory) -> Self {
        Self {
            category,
            count: 0,
            last_seen: Utc::now(),
            successful_strategies: Vec::new(),
            avg_time_to_success: None,
        }
    }
}

/// One failure attributed to a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub signature: String,
}

/// Recommended retry parameters for a category
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    pub name: &'static str,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            name: "standard-backoff",
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// Failure-pattern detector
#[derive(Debug, Default)]
pub struct FailurePatternDetector {
    patterns: DashMap<FailureCategory, FailurePattern>,
    tasks: DashMap<String, VecDeque<FailureRecord>>,
}

impl FailurePatternDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, category: FailureCategory, signature: &str, task_id: Option<&str>) {
        {
            let mut pattern = self
                .patterns
                .entry(category)
                .or_insert_with(|| FailurePattern::new(category));
            pattern.count += 1;
            pattern.last_seen = Utc::now();
        }

        if let Some(task_id) = task_id {
            let mut history = self.tasks.entry(task_id.to_string()).or_default();
            history.push_back(FailureRecord {
                category,
                signature: signature.to_string(),
            });
            while history.len() > TASK_HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// Record that `strategy` recovered from `category` after `elapsed`
    pub fn record_success(&self, category: FailureCategory, strategy: &str, elapsed: Duration) {
        let mut pattern = self
            .patterns
            .entry(category)
            .or_insert_with(|| FailurePattern::new(category));

        if !pattern.successful_strategies.iter().any(|s| s == strategy) {
            pattern.successful_strategies.push(strategy.to_string());
            if pattern.successful_strategies.len() > STRATEGY_HISTORY_LIMIT {
                pattern.successful_strategies.remove(0);
            }
        }

        pattern.avg_time_to_success = Some(match pattern.avg_time_to_success {
            Some(old) => (old + elapsed) / 2,
            None => elapsed,
        });
    }

    /// Retry parameters tuned to the category
    pub fn recommend(&self, category: FailureCategory) -> RetryStrategy {
        match category {
            FailureCategory::Timeout => {
                // Aim below the usual recovery time, within sane bounds
                let initial_delay = self
                    .pattern(category)
                    .and_then(|p| p.avg_time_to_success)
                    .map(|avg| {
                        (avg / 2).clamp(Duration::from_millis(500), Duration::from_secs(5))
                    })
                    .unwrap_or(Duration::from_secs(1));
                RetryStrategy {
                    name: "timeout-gentle-backoff",
                    max_attempts: 2,
                    initial_delay,
                    backoff_factor: 1.5,
                }
            }
            FailureCategory::RateLimit => RetryStrategy {
                name: "rate-limit-long-backoff",
                max_attempts: 5,
                initial_delay: Duration::from_secs(60),
                backoff_factor: 3.0,
            },
            FailureCategory::Network => RetryStrategy {
                name: "network-moderate-backoff",
                max_attempts: 4,
                initial_delay: Duration::from_secs(1),
                backoff_factor: 2.5,
            },
            FailureCategory::Auth | FailureCategory::Unknown => RetryStrategy::default(),
        }
    }

    pub fn pattern(&self, category: FailureCategory) -> Option<FailurePattern> {
        self.patterns.get(&category).map(|p| p.clone())
    }

    pub fn patterns(&self) -> Vec<FailurePattern> {
        let mut patterns: Vec<FailurePattern> = self.patterns.iter().map(|p| p.clone()).collect();
        patterns.sort_by_key(|p| p.category);
        patterns
    }

    /// Oldest first
    pub fn task_failures(&self, task_id: &str) -> Vec<FailureRecord> {
        self.tasks
            .get(task_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_task(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommendations_by_category() {
        let detector = FailurePatternDetector::new();

        let rate = detector.recommend(FailureCategory::RateLimit);
        assert_eq!(rate.max_attempts, 5);
        assert!(rate.initial_delay >= Duration::from_secs(60));
        assert_eq!(rate.backoff_factor, 3.0);

        let network = detector.recommend(FailureCategory::Network);
        assert_eq!(network.max_attempts, 4);
        assert_eq!(network.backoff_factor, 2.5);

        assert_eq!(detector.recommend(FailureCategory::Unknown), RetryStrategy::default());
    }

    #[test]
    fn test_timeout_delay_follows_history() {
        let detector = FailurePatternDetector::new();
        assert_eq!(
            detector.recommend(FailureCategory::Timeout).initial_delay,
            Duration::from_secs(1)
        );

        detector.record_success(FailureCategory::Timeout, "timeout-gentle-backoff", Duration::from_secs(4));
        let timeout = detector.recommend(FailureCategory::Timeout);
        assert_eq!(timeout.max_attempts, 2);
        assert_eq!(timeout.backoff_factor, 1.5);
        assert_eq!(timeout.initial_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_time_to_success_moving_average() {
        let detector = FailurePatternDetector::new();
        detector.record_success(FailureCategory::Network, "a", Duration::from_secs(4));
        detector.record_success(FailureCategory::Network, "a", Duration::from_secs(2));

        let pattern = detector.pattern(FailureCategory::Network).unwrap();
        assert_eq!(pattern.avg_time_to_success, Some(Duration::from_secs(3)));
        assert_eq!(pattern.successful_strategies, vec!["a".to_string()]);
    }

    #[test]
    fn test_task_history_is_bounded() {
        let detector = FailurePatternDetector::new();
        for _ in 0..15 {
            detector.record_failure(FailureCategory::Timeout, "timeout:x", Some("task-1"));
        }
        assert_eq!(detector.task_failures("task-1").len(), TASK_HISTORY_LIMIT);
        assert_eq!(detector.pattern(FailureCategory::Timeout).unwrap().count, 15);

        detector.clear_task("task-1");
        assert!(detector.task_failures("task-1").is_empty());
    }
}
