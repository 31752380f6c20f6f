//! Circuit breaker for operations wrapping external tools
//!
//! ```text
//! Closed ──(failure_threshold failures)──▶ Open
//!   ▲                                       │ recovery_timeout since last failure
//!   │ trial succeeds                        ▼
//!   └───────────────────────────────── HalfOpen ──(trial fails)──▶ Open
//! ```
//!
//! Half-open lets exactly one trial through; concurrent callers are rejected
//! until the trial settles.

use crate::retry::classify::RetryableError;
use crate::utils::errors::GovernorError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Wait after the last failure before probing, in milliseconds
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("Circuit failure_threshold cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Error from a call through the breaker
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Rejected without invoking the operation
    #[error("Circuit '{name}' is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    /// The operation ran and failed
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

impl<E: fmt::Display> CircuitError<E> {
    pub fn into_governor_error(self) -> GovernorError {
        match self {
            CircuitError::Open { name, retry_in } => GovernorError::CircuitOpen { name, retry_in },
            CircuitError::Operation(e) => GovernorError::RuntimeError(e.to_string()),
        }
    }
}

impl<E: RetryableError> RetryableError for CircuitError<E> {
    fn error_kind(&self) -> Option<&str> {
        match self {
            CircuitError::Open { .. } => Some("circuit_open"),
            CircuitError::Operation(e) => e.error_kind(),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving Open to HalfOpen once the recovery timeout has passed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            retry_in_ms: match inner.state {
                CircuitState::Open => Some(self.retry_in(&inner).as_millis() as u64),
                _ => None,
            },
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open && self.retry_in(inner).is_zero() {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn retry_in(&self, inner: &Inner) -> Duration {
        inner
            .last_failure_time
            .map(|at| self.config.recovery_timeout().saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                "Circuit '{}' {} -> open after {} failure(s)",
                self.name, inner.state, inner.failure_count
            ),
            _ => info!("Circuit '{}' {} -> {}", self.name, inner.state, to),
        }
        inner.state = to;
        metrics::counter!("procgov_circuit_transitions_total", "circuit" => self.name.clone(), "to" => to.to_string())
            .increment(1);
    }

    /// Admit a call or reject it. Returns whether the call is the half-open trial.
    fn try_acquire(&self) -> Result<bool, Duration> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(self.retry_in(&inner)),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            _ => {}
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Run `operation` unless the circuit is open
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_trial = self.try_acquire().map_err(|retry_in| CircuitError::Open {
            name: self.name.clone(),
            retry_in,
        })?;

        let mut trial = TrialGuard {
            breaker: self,
            armed: is_trial,
        };
        let result = operation().await;
        trial.armed = false;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Operation(e))
            }
        }
    }
}

/// Releases the half-open trial slot if the trial future is dropped
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

/// One breaker per dependency name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `name`, created on first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
