//! Adaptive retry coordinator
//!
//! # Backoff
//!
//! Delay before attempt n+1:
//!
//! ```text
//! min(max_delay, initial_delay × complexity × tokens × backoff_factor^(n-1)) ± 25% jitter
//! ```
//!
//! | Complexity | Multiplier |
//! |------------|------------|
//! | low        | 0.8        |
//! | medium     | 1.0        |
//! | high       | 1.5        |
//!
//! The token multiplier is `min(1 + estimated_tokens / 10000, 3.0)`.
//!
//! On the first failure the coordinator asks the failure-pattern detector for
//! a category-specific strategy. It adopts that strategy's backoff factor and
//! raises (never lowers) the attempt budget and initial delay.

use crate::retry::classify::{classify, Classification, FailureCategory, RetryableError};
use crate::retry::patterns::{FailurePatternDetector, RetryStrategy};
use crate::utils::errors::{GovernorError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Jitter range as a fraction of the delay
const JITTER_RATIO: f64 = 0.25;

/// Repeated identical failures after which a task stops retrying
const REPEATED_FAILURE_LIMIT: usize = 3;

/// Timeout failures after which a high-complexity task stops retrying
const HIGH_COMPLEXITY_TIMEOUT_LIMIT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskComplexity {
    pub fn multiplier(&self) -> f64 {
        match self {
            TaskComplexity::Low => 0.8,
            TaskComplexity::Medium => 1.0,
            TaskComplexity::High => 1.5,
        }
    }
}

/// What the retried operation is working on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub complexity: TaskComplexity,
    pub estimated_tokens: u64,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn token_multiplier(&self) -> f64 {
        (1.0 + self.estimated_tokens as f64 / 10_000.0).min(3.0)
    }
}

/// Retry settings loaded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,

    /// Error kinds retried regardless of message heuristics
    pub retryable_kinds: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 120_000,
            backoff_factor: 2.0,
            jitter: true,
            retryable_kinds: vec![
                "admission_denied".to_string(),
                "execution_timeout_exceeded".to_string(),
                "timed_out".to_string(),
                "connection_refused".to_string(),
                "connection_reset".to_string(),
            ],
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("Retry max_attempts cannot be 0".to_string());
        }
        if self.backoff_factor < 1.0 {
            return Err("Retry backoff_factor cannot be below 1.0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("Retry max_delay cannot be below initial_delay".to_string());
        }
        Ok(())
    }

    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            retryable_kinds: self.retryable_kinds.clone(),
            task_context: None,
            cancel: None,
        }
    }
}

/// Options for one `with_retry` call
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub retryable_kinds: Vec<String>,
    pub task_context: Option<TaskContext>,

    /// Aborts the retry sequence, including a backoff in progress
    pub cancel: Option<CancellationToken>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryConfig::default().to_options()
    }
}

impl RetryOptions {
    pub fn with_task(mut self, context: TaskContext) -> Self {
        self.task_context = Some(context);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Why a retry sequence failed
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Attempt budget used up; carries the last error
    Exhausted(E),
    /// Classified as final, or stopped by the task context guard
    NonRetryable(E),
    /// Cancelled; carries the last error if any attempt had failed
    Cancelled(Option<E>),
}

impl<E> RetryFailure<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryFailure::Exhausted(e) | RetryFailure::NonRetryable(e) => Some(e),
            RetryFailure::Cancelled(e) => e.as_ref(),
        }
    }
}

/// Outcome of `with_retry`
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub outcome: std::result::Result<T, RetryFailure<E>>,
    pub attempts: u32,
    pub total_duration: Duration,

    /// Strategy adopted after the first failure
    pub strategy: Option<&'static str>,
}

impl<T, E: std::fmt::Display> RetryResult<T, E> {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Collapse into the crate error type
    pub fn into_result(self) -> Result<T> {
        let attempts = self.attempts;
        self.outcome.map_err(|failure| match failure {
            RetryFailure::Exhausted(e) | RetryFailure::NonRetryable(e) => GovernorError::RetryExhausted {
                attempts,
                last_error: e.to_string(),
            },
            RetryFailure::Cancelled(_) => GovernorError::Cancelled,
        })
    }
}

/// Delay before attempt `attempt + 1`, without jitter
pub fn backoff_delay(
    attempt: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    context: Option<&TaskContext>,
) -> Duration {
    let (complexity, tokens) = context
        .map(|c| (c.complexity.multiplier(), c.token_multiplier()))
        .unwrap_or((1.0, 1.0));
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = initial_delay.as_secs_f64() * complexity * tokens * backoff_factor.powi(exponent);

    if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
        max_delay
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    delay.mul_f64(factor)
}

/// Retry coordinator
///
/// Clones share the failure-pattern detector.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    detector: Arc<FailurePatternDetector>,
}

impl RetryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detector(detector: Arc<FailurePatternDetector>) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &FailurePatternDetector {
        &self.detector
    }

    /// Reason to stop retrying based on the task's failure history
    fn context_guard(&self, context: &TaskContext, current: &Classification) -> Option<String> {
        let history = self.detector.task_failures(&context.task_id);

        if history.len() >= REPEATED_FAILURE_LIMIT
            && history
                .iter()
                .rev()
                .take(REPEATED_FAILURE_LIMIT)
                .all(|r| r.signature == current.signature)
        {
            return Some(format!(
                "task {} failed the same way {} times in a row",
                context.task_id, REPEATED_FAILURE_LIMIT
            ));
        }

        if context.complexity == TaskComplexity::High && current.category == FailureCategory::Timeout {
            let timeouts = history
                .iter()
                .filter(|r| r.category == FailureCategory::Timeout)
                .count()
                + 1;
            if timeouts >= HIGH_COMPLEXITY_TIMEOUT_LIMIT {
                return Some(format!(
                    "high-complexity task {} timed out {} times",
                    context.task_id, timeouts
                ));
            }
        }

        None
    }

    /// Run `operation` until it succeeds, fails for good, or runs out of attempts
    pub async fn with_retry<T, E, F, Fut>(&self, mut operation: F, options: RetryOptions) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: RetryableError,
    {
        let started = Instant::now();
        let task_id = options.task_context.as_ref().map(|c| c.task_id.as_str());
        let mut max_attempts = options.max_attempts.max(1);
        let mut initial_delay = options.initial_delay;
        let mut backoff_factor = options.backoff_factor;
        let mut strategy: Option<RetryStrategy> = None;
        let mut last_category: Option<FailureCategory> = None;
        let mut last_error: Option<E> = None;
        let mut attempt = 0u32;

        let finish = |outcome, attempts, strategy: &Option<RetryStrategy>| RetryResult {
            outcome,
            attempts,
            total_duration: started.elapsed(),
            strategy: strategy.as_ref().map(|s| s.name),
        };

        loop {
            if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return finish(Err(RetryFailure::Cancelled(last_error)), attempt, &strategy);
            }

            attempt += 1;
            let result = match &options.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return finish(Err(RetryFailure::Cancelled(last_error)), attempt, &strategy);
                    }
                    result = operation() => result,
                },
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if let Some(category) = last_category {
                        let name = strategy.as_ref().map(|s| s.name).unwrap_or("standard-backoff");
                        self.detector.record_success(category, name, started.elapsed());
                        info!("Recovered from {} failure after {} attempt(s)", category, attempt);
                    }
                    if let Some(task_id) = task_id {
                        self.detector.clear_task(task_id);
                    }
                    return finish(Ok(value), attempt, &strategy);
                }
                Err(error) => error,
            };

            let classification = classify(&error, &options.retryable_kinds);
            let guard = options
                .task_context
                .as_ref()
                .and_then(|context| self.context_guard(context, &classification));
            self.detector
                .record_failure(classification.category, &classification.signature, task_id);
            last_category = Some(classification.category);

            if !classification.retryable {
                debug!("Attempt {} failed with a non-retryable error: {}", attempt, error);
                return finish(Err(RetryFailure::NonRetryable(error)), attempt, &strategy);
            }

            if let Some(reason) = guard {
                warn!("Not retrying: {}", reason);
                return finish(Err(RetryFailure::NonRetryable(error)), attempt, &strategy);
            }

            if attempt == 1 {
                let recommended = self.detector.recommend(classification.category);
                max_attempts = max_attempts.max(recommended.max_attempts);
                initial_delay = initial_delay.max(recommended.initial_delay);
                backoff_factor = recommended.backoff_factor;
                debug!(
                    "Adopting {} for {} failure: {} attempts, {:?} initial delay, x{}",
                    recommended.name, classification.category, max_attempts, initial_delay, backoff_factor
                );
                strategy = Some(recommended);
            }

            if attempt >= max_attempts {
                warn!("Giving up after {} attempt(s): {}", attempt, error);
                return finish(Err(RetryFailure::Exhausted(error)), attempt, &strategy);
            }

            let mut delay = backoff_delay(
                attempt,
                initial_delay,
                backoff_factor,
                options.max_delay,
                options.task_context.as_ref(),
            );
            if options.jitter {
                delay = apply_jitter(delay);
            }

            warn!(
                "Attempt {}/{} failed ({}): {}. Retrying in {:?}",
                attempt, max_attempts, classification.category, error, delay
            );
            metrics::counter!("procgov_retries_total", "category" => classification.category.as_str())
                .increment(1);

            last_error = Some(error);
            match &options.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => {
                        return finish(Err(RetryFailure::Cancelled(last_error)), attempt, &strategy);
                    }
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}
