//! Error types for the governance core
//!
//! Every error carries a stable machine-readable kind (see
//! [`GovernorError::kind`]) so the retry coordinator can match errors against
//! a configured list of retryable kinds without string parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Resource dimension that was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Cpu,
    Memory,
    Zombie,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Cpu => write!(f, "cpu"),
            ViolationKind::Memory => write!(f, "memory"),
            ViolationKind::Zombie => write!(f, "zombie"),
        }
    }
}

/// Governance errors
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    #[error("Reservation {0} has expired")]
    ReservationExpired(String),

    #[error("Reservation {0} not found")]
    ReservationNotFound(String),

    #[error("Reservation {0} has already been used")]
    ReservationAlreadyUsed(String),

    #[error("Process {0} is already registered")]
    DuplicateProcess(String),

    #[error("Resource violation: {0}")]
    ResourceViolation(ViolationKind),

    #[error("Execution timeout exceeded")]
    ExecutionTimeoutExceeded,

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Retry exhausted after {attempts} attempt(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Circuit '{name}' is open, retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Telemetry error: {0}")]
    TelemetryError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GovernorError {
    /// Stable machine-readable kind for this error
    pub fn kind(&self) -> &'static str {
        match self {
            GovernorError::AdmissionDenied(_) => "admission_denied",
            GovernorError::ReservationExpired(_) => "reservation_expired",
            GovernorError::ReservationNotFound(_) => "reservation_not_found",
            GovernorError::ReservationAlreadyUsed(_) => "reservation_already_used",
            GovernorError::DuplicateProcess(_) => "duplicate_process",
            GovernorError::ResourceViolation(_) => "resource_violation",
            GovernorError::ExecutionTimeoutExceeded => "execution_timeout_exceeded",
            GovernorError::ProcessSpawnFailed(_) => "process_spawn_failed",
            GovernorError::RetryExhausted { .. } => "retry_exhausted",
            GovernorError::CircuitOpen { .. } => "circuit_open",
            GovernorError::Cancelled => "cancelled",
            GovernorError::TelemetryError(_) => "telemetry_error",
            GovernorError::ConfigError(_) => "config_error",
            GovernorError::RuntimeError(_) => "runtime_error",
            GovernorError::Io(_) => "io",
        }
    }

    /// Whether this is one of the reservation lifecycle failures
    pub fn is_reservation_error(&self) -> bool {
        matches!(
            self,
            GovernorError::ReservationExpired(_)
                | GovernorError::ReservationNotFound(_)
                | GovernorError::ReservationAlreadyUsed(_)
        )
    }
}

impl From<config::ConfigError> for GovernorError {
    fn from(err: config::ConfigError) -> Self {
        GovernorError::ConfigError(err.to_string())
    }
}
