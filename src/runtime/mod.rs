//! Governed process runtime
//!
//! This module gates, launches, and polices tool subprocesses:
//!
//! - **Admission**: per-kind and total concurrency limits with reservations
//! - **Process Manager**: spawning, exit/activity notification, signal escalation
//! - **Resource Limiter**: CPU, memory, and wall-clock enforcement for one process
//! - **Events**: notifications broadcast to subscribers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  AdmissionController                     │
//! │   reservations ──register──▶ active processes            │
//! │        │                        │  ▲                     │
//! │        │ reserve_slot           │  │ exit / activity     │
//! │        ▼                        ▼  │                     │
//! │   EventBus ◀──────────── ProcessHandle ◀── reaper task   │
//! │                                 │                        │
//! │                         ResourceLimiter                  │
//! │                    (check loop + timeout timers)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Defaults
//!
//! - **Limits**: 5 AI assistant, 3 + 3 test runners, 12 total
//! - **Reservations**: expire after 30s, swept every 10s
//! - **Enforcement**: 3 consecutive over-threshold samples, 5min timeout, 5s grace

pub mod admission;
pub mod events;
pub mod process_manager;
pub mod resource_limiter;

// Re-export commonly used types
pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionStats, ManagedProcess, ProcessLimits, ProcessSnapshot,
    ReservationId,
};
pub use events::{EventBus, GovernanceEvent, UnregisterReason};
pub use process_manager::{ExitOutcome, ProcessHandle, ProcessKind, ProcessManager, SpawnConfig};
pub use resource_limiter::{ResourceLimitResult, ResourceLimiter, ResourceLimits, Termination, Violation};
