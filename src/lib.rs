//! Process admission control and resource governance
//!
//! This library decides whether a tool subprocess may be spawned, tracks its
//! resource consumption and lifecycle, enforces CPU/memory/time limits with
//! escalating termination, and governs retries and circuit breaking for the
//! operations that wrap those subprocesses.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **runtime**: Admission control, process handles, limit enforcement, events
//! - **telemetry**: OS resource sampling, history, and health scoring
//! - **retry**: Failure classification, adaptive backoff, circuit breakers
//! - **governor**: End-to-end reserve, spawn, register, enforce flow
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and error types

// Public module exports
pub mod governor;
pub mod observability;
pub mod retry;
pub mod runtime;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use governor::{GovernedRun, Governor};
pub use runtime::admission::{AdmissionConfig, AdmissionController, ProcessLimits};
pub use runtime::process_manager::{ProcessKind, SpawnConfig};
pub use utils::config::GovernorConfig;
pub use utils::errors::{GovernorError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub target_os: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: VERSION,
            target_os: std::env::consts::OS,
        }
    }
}
