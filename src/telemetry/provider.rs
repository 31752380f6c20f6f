//! OS statistics providers
//!
//! The monitor never talks to the OS directly. It goes through a
//! [`ProcessStatsProvider`], so the Linux build can read `/proc` natively
//! while other targets use the platform process API through `sysinfo`.

use crate::telemetry::sample::ResourceSample;
use crate::utils::errors::Result;
use std::sync::Arc;

/// Source of per-process resource statistics
pub trait ProcessStatsProvider: Send + Sync {
    /// Sample one process. `Ok(None)` means the process no longer exists.
    fn sample(&self, pid: u32) -> Result<Option<ResourceSample>>;

    /// Sample every process visible to this user
    fn list_all(&self) -> Result<Vec<ResourceSample>>;

    /// Drop any per-pid state kept between samples
    fn forget(&self, _pid: u32) {}

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Provider for the current platform
#[cfg(target_os = "linux")]
pub fn default_provider() -> Arc<dyn ProcessStatsProvider> {
    Arc::new(crate::telemetry::procfs::ProcfsProvider::new())
}

#[cfg(not(target_os = "linux"))]
pub fn default_provider() -> Arc<dyn ProcessStatsProvider> {
    Arc::new(crate::telemetry::native::SysinfoProvider::new())
}
