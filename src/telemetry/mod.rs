//! Resource telemetry
//!
//! - **Provider**: OS statistics source (`/proc` on Linux, `sysinfo` elsewhere)
//! - **Monitor**: periodic polling with bounded per-pid history
//! - **Health**: 0-100 health scoring with trend analysis
//!
//! ```text
//! ProcessMonitor ── poll ──▶ ProcessStatsProvider ──▶ /proc/<pid>/stat
//!       │                                          └─▶ sysinfo::System
//!       └── history[pid] ──▶ analyze_health ──▶ HealthMetrics
//! ```

pub mod health;
pub mod monitor;
pub mod native;
#[cfg(target_os = "linux")]
pub mod procfs;
pub mod provider;
pub mod sample;

pub use health::{analyze_health, HealthMetrics, HealthThresholds};
pub use monitor::{HealthReport, MonitorConfig, ProcessMonitor};
pub use provider::{default_provider, ProcessStatsProvider};
pub use sample::{ProcessState, ResourceSample};
