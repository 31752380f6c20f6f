//! Admission controller for governed subprocesses
//!
//! Instead of letting every caller spawn tool processes freely, callers first
//! reserve a slot, then spawn, then register the spawned process against the
//! reservation.
//!
//! # Architecture
//!
//! ```text
//! AdmissionController
//! ├─ Reservations: {rsv_..: kind, expires_at}   (slots promised, not spawned)
//! ├─ Active: {id: ManagedProcess}               (registered, running)
//! └─ Tombstones: {rsv_..: consumed|expired}     (recently retired reservations)
//! ```
//!
//! Admission counts active processes plus still-valid reservations, so a burst
//! of reservations cannot over-commit the limits before anything is spawned.
//! All bookkeeping sits behind one mutex; the check and the insert happen
//! under the same lock.

use crate::runtime::events::{EventBus, GovernanceEvent, UnregisterReason};
use crate::runtime::process_manager::{ProcessHandle, ProcessKind};
use crate::utils::errors::{GovernorError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// How long an emergency shutdown waits for the state lock
const EMERGENCY_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Concurrency limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessLimits {
    pub max_ai_assistant: usize,
    pub max_test_runner_a: usize,
    pub max_test_runner_b: usize,

    /// Bound on the sum over all kinds
    pub max_total: usize,

    /// Projected total at which an approaching-limit event is emitted
    pub warning_threshold: usize,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            max_ai_assistant: 5,
            max_test_runner_a: 3,
            max_test_runner_b: 3,
            max_total: 12,
            warning_threshold: 10,
        }
    }
}

impl ProcessLimits {
    /// Per-kind cap. `Other` is bounded only by `max_total`.
    pub fn cap_for(&self, kind: ProcessKind) -> Option<usize> {
        match kind {
            ProcessKind::AiAssistant => Some(self.max_ai_assistant),
            ProcessKind::TestRunnerA => Some(self.max_test_runner_a),
            ProcessKind::TestRunnerB => Some(self.max_test_runner_b),
            ProcessKind::Other => None,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_total == 0 {
            return Err("max_total cannot be 0".to_string());
        }
        for kind in ProcessKind::ALL {
            if self.cap_for(kind) == Some(0) {
                return Err(format!("{} limit cannot be 0", kind));
            }
        }
        if self.warning_threshold > self.max_total {
            return Err(format!(
                "warning_threshold ({}) cannot exceed max_total ({})",
                self.warning_threshold, self.max_total
            ));
        }
        Ok(())
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub limits: ProcessLimits,

    /// Default reservation lifetime in milliseconds (default: 30s)
    pub reservation_timeout_ms: u64,

    /// Expired-reservation sweep interval in milliseconds (default: 10s)
    pub cleanup_interval_ms: u64,

    /// How long retired reservation ids are remembered (default: 5min)
    pub tombstone_retention_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limits: ProcessLimits::default(),
            reservation_timeout_ms: 30_000,
            cleanup_interval_ms: 10_000,
            tombstone_retention_ms: 300_000,
        }
    }
}

impl AdmissionConfig {
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.tombstone_retention_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.limits.validate()?;
        if self.reservation_timeout_ms == 0 {
            return Err("Reservation timeout cannot be 0".to_string());
        }
        if self.cleanup_interval_ms == 0 {
            return Err("Cleanup interval cannot be 0".to_string());
        }
        Ok(())
    }
}

pub type ReservationId = String;

/// A time-boxed promise of one slot
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub kind: ProcessKind,
    pub component: String,
    pub reserved_at: Instant,
    pub expires_at: Instant,
}

impl Reservation {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    Consumed,
    Expired,
    Cancelled,
}

/// A registered, running subprocess
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub id: String,
    pub kind: ProcessKind,
    pub component: String,
    pub pid: u32,
    pub handle: ProcessHandle,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub last_activity: Instant,
}

impl ManagedProcess {
    pub fn snapshot(&self, now: Instant) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            component: self.component.clone(),
            pid: self.pid,
            started_at: self.started_at_utc,
            uptime_ms: now.saturating_duration_since(self.started_at).as_millis() as u64,
            idle_ms: now.saturating_duration_since(self.last_activity).as_millis() as u64,
        }
    }
}

/// Serializable view of a managed process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub kind: ProcessKind,
    pub component: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub idle_ms: u64,
}

/// Admission statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub active: BTreeMap<ProcessKind, usize>,
    pub reserved: BTreeMap<ProcessKind, usize>,
    pub active_total: usize,
    pub reserved_total: usize,
    pub limits: ProcessLimits,
    pub emergency_shutdowns: u64,
}

#[derive(Debug, Default)]
struct AdmissionState {
    reservations: HashMap<ReservationId, Reservation>,
    active: HashMap<String, ManagedProcess>,
    tombstones: HashMap<ReservationId, (Tombstone, Instant)>,
}

impl AdmissionState {
    /// Load of one kind and of all kinds: active plus unexpired reservations
    fn load(&self, kind: ProcessKind, now: Instant) -> (usize, usize) {
        let active_kind = self.active.values().filter(|p| p.kind == kind).count();
        let valid: Vec<&Reservation> = self
            .reservations
            .values()
            .filter(|r| !r.is_expired(now))
            .collect();
        let reserved_kind = valid.iter().filter(|r| r.kind == kind).count();

        (
            active_kind + reserved_kind,
            self.active.len() + valid.len(),
        )
    }

    fn purge(&mut self, now: Instant, retention: Duration) -> usize {
        let expired: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id.clone())
            .collect();

        for id in &expired {
            self.reservations.remove(id);
            self.tombstones.insert(id.clone(), (Tombstone::Expired, now));
        }

        self.tombstones
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < retention);

        expired.len()
    }

    /// Remove an active process, but only if it is still the same OS process
    fn remove_active(&mut self, id: &str, pid: u32) -> Option<ManagedProcess> {
        match self.active.get(id) {
            Some(process) if process.pid == pid => self.active.remove(id),
            _ => None,
        }
    }
}

/// Admission controller
///
/// Construct one per application and share it by `Arc`.
pub struct AdmissionController {
    config: AdmissionConfig,
    state: Arc<Mutex<AdmissionState>>,
    events: EventBus,
    shutdown_count: AtomicU64,
    background: CancellationToken,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        info!(
            "Admission controller limits: ai-assistant={} test-runner-a={} test-runner-b={} total={}",
            config.limits.max_ai_assistant,
            config.limits.max_test_runner_a,
            config.limits.max_test_runner_b,
            config.limits.max_total
        );

        Self {
            config,
            state: Arc::new(Mutex::new(AdmissionState::default())),
            events: EventBus::default(),
            shutdown_count: AtomicU64::new(0),
            background: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn limits(&self) -> &ProcessLimits {
        &self.config.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernanceEvent> {
        self.events.subscribe()
    }

    /// Reserve one slot of `kind`, valid for `timeout` (default from config)
    pub fn reserve_slot(
        &self,
        kind: ProcessKind,
        component: &str,
        timeout: Option<Duration>,
    ) -> Result<ReservationId> {
        let now = Instant::now();
        let limits = &self.config.limits;
        let timeout = timeout.unwrap_or_else(|| self.config.reservation_timeout());

        let mut state = self.state.lock();
        let (kind_load, total_load) = state.load(kind, now);

        if let Some(cap) = limits.cap_for(kind) {
            if kind_load + 1 > cap {
                drop(state);
                return Err(self.deny(kind, format!("{} process limit exceeded: {}/{}", kind, kind_load, cap)));
            }
        }

        if total_load + 1 > limits.max_total {
            drop(state);
            return Err(self.deny(
                kind,
                format!("Total process limit exceeded: {}/{}", total_load, limits.max_total),
            ));
        }

        let id = format!("rsv_{}", Ulid::new());
        state.reservations.insert(
            id.clone(),
            Reservation {
                id: id.clone(),
                kind,
                component: component.to_string(),
                reserved_at: now,
                expires_at: now + timeout,
            },
        );
        drop(state);

        let projected_total = total_load + 1;
        debug!(
            "Reserved {} slot {} for {} ({}/{} total)",
            kind, id, component, projected_total, limits.max_total
        );
        metrics::counter!("procgov_reservations_total", "kind" => kind.as_str()).increment(1);

        if projected_total >= limits.warning_threshold {
            warn!(
                "Approaching process limit: {}/{} (warning at {})",
                projected_total, limits.max_total, limits.warning_threshold
            );
            self.events.publish(GovernanceEvent::ApproachingLimit {
                kind,
                projected_total,
                warning_threshold: limits.warning_threshold,
                max_total: limits.max_total,
                at: Utc::now(),
            });
        }

        Ok(id)
    }

    fn deny(&self, kind: ProcessKind, reason: String) -> GovernorError {
        warn!("Admission denied for {}: {}", kind, reason);
        metrics::counter!("procgov_admission_denials_total", "kind" => kind.as_str()).increment(1);
        GovernorError::AdmissionDenied(reason)
    }

    /// Release a reservation that will not be used. Returns `false` if unknown.
    pub fn cancel_reservation(&self, reservation_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.reservations.remove(reservation_id) {
            Some(_) => {
                state.tombstones.insert(
                    reservation_id.to_string(),
                    (Tombstone::Cancelled, Instant::now()),
                );
                debug!("Cancelled reservation {}", reservation_id);
                true
            }
            None => false,
        }
    }

    /// Turn a reservation into an active managed process
    ///
    /// Expiry is checked here as well as by the cleanup task, so an expired
    /// reservation can never be registered.
    pub fn register_process(
        &self,
        reservation_id: &str,
        handle: ProcessHandle,
        explicit_id: Option<String>,
    ) -> Result<ManagedProcess> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some((tombstone, _)) = state.tombstones.get(reservation_id) {
            return Err(match tombstone {
                Tombstone::Consumed => GovernorError::ReservationAlreadyUsed(reservation_id.to_string()),
                Tombstone::Expired => GovernorError::ReservationExpired(reservation_id.to_string()),
                Tombstone::Cancelled => GovernorError::ReservationNotFound(reservation_id.to_string()),
            });
        }

        let reservation = match state.reservations.get(reservation_id) {
            Some(reservation) => reservation.clone(),
            None => return Err(GovernorError::ReservationNotFound(reservation_id.to_string())),
        };

        if reservation.is_expired(now) {
            state.reservations.remove(reservation_id);
            state
                .tombstones
                .insert(reservation_id.to_string(), (Tombstone::Expired, now));
            return Err(GovernorError::ReservationExpired(reservation_id.to_string()));
        }

        let Some(pid) = handle.pid() else {
            return Err(GovernorError::ProcessSpawnFailed(
                "Process handle has no PID".to_string(),
            ));
        };

        let id = explicit_id.unwrap_or_else(|| format!("{}-{}", reservation.kind, Ulid::new()));
        if state.active.contains_key(&id) {
            return Err(GovernorError::DuplicateProcess(id));
        }

        state.reservations.remove(reservation_id);
        state
            .tombstones
            .insert(reservation_id.to_string(), (Tombstone::Consumed, now));

        let process = ManagedProcess {
            id: id.clone(),
            kind: reservation.kind,
            component: reservation.component,
            pid,
            handle: handle.clone(),
            started_at: now,
            started_at_utc: Utc::now(),
            last_activity: now,
        };
        state.active.insert(id.clone(), process.clone());
        let active_total = state.active.len();
        drop(state);

        info!("Registered {} process {} (PID {})", process.kind, id, pid);
        metrics::counter!("procgov_registrations_total", "kind" => process.kind.as_str()).increment(1);
        metrics::gauge!("procgov_active_processes").set(active_total as f64);

        self.spawn_lifecycle_listener(id.clone(), process.kind, pid, handle);
        self.events.publish(GovernanceEvent::ProcessRegistered {
            id,
            kind: process.kind,
            component: process.component.clone(),
            pid,
            at: Utc::now(),
        });

        Ok(process)
    }

    /// Track stdio activity and unregister on exit
    fn spawn_lifecycle_listener(&self, id: String, kind: ProcessKind, pid: u32, handle: ProcessHandle) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut activity = handle.activity();
            let exit = handle.wait();
            tokio::pin!(exit);

            let outcome = loop {
                tokio::select! {
                    outcome = &mut exit => break outcome,
                    changed = activity.changed() => {
                        if changed.is_err() {
                            // Both stdio pumps are done
                            break (&mut exit).await;
                        }
                        let at = *activity.borrow_and_update();
                        if let Some(process) = state.lock().active.get_mut(&id) {
                            if process.pid == pid {
                                process.last_activity = at;
                            }
                        }
                    }
                }
            };

            let (removed, active_total) = {
                let mut state = state.lock();
                let removed = state.remove_active(&id, pid);
                (removed, state.active.len())
            };

            if removed.is_some() {
                let reason = if outcome.error.is_some() {
                    UnregisterReason::Errored
                } else {
                    UnregisterReason::Exited
                };
                debug!("Process {} (PID {}) {:?}: {:?}", id, pid, reason, outcome);
                metrics::gauge!("procgov_active_processes").set(active_total as f64);
                events.publish(GovernanceEvent::ProcessUnregistered {
                    id,
                    kind,
                    reason,
                    exit_code: outcome.code,
                    at: Utc::now(),
                });
            }
        });
    }

    /// Remove a process from the active set. No-op if absent.
    pub fn unregister_process(&self, id: &str) {
        let (removed, active_total) = {
            let mut state = self.state.lock();
            let removed = state.active.remove(id);
            (removed, state.active.len())
        };

        if let Some(process) = removed {
            debug!("Unregistered process {}", id);
            metrics::gauge!("procgov_active_processes").set(active_total as f64);
            self.events.publish(GovernanceEvent::ProcessUnregistered {
                id: id.to_string(),
                kind: process.kind,
                reason: UnregisterReason::Explicit,
                exit_code: process.handle.exit_outcome().and_then(|o| o.code),
                at: Utc::now(),
            });
        }
    }

    /// Kill every active process and drop all reservations
    ///
    /// Returns the number of processes terminated.
    pub fn emergency_shutdown(&self, reason: &str) -> usize {
        let Some(mut state) = self.state.try_lock_for(EMERGENCY_LOCK_TIMEOUT) else {
            error!("Emergency shutdown ({}) could not acquire admission state", reason);
            return 0;
        };

        let now = Instant::now();
        let processes: Vec<ManagedProcess> = state.active.drain().map(|(_, p)| p).collect();
        let reservations: Vec<ReservationId> = state.reservations.drain().map(|(id, _)| id).collect();
        for id in &reservations {
            state.tombstones.insert(id.clone(), (Tombstone::Cancelled, now));
        }
        drop(state);

        for process in &processes {
            process.handle.force_kill();
        }

        let terminated = processes.len();
        self.shutdown_count.fetch_add(1, Ordering::SeqCst);
        error!(
            "Emergency shutdown: {} (terminated {} process(es), cleared {} reservation(s))",
            reason,
            terminated,
            reservations.len()
        );
        metrics::counter!("procgov_emergency_shutdowns_total").increment(1);
        metrics::gauge!("procgov_active_processes").set(0.0);

        self.events.publish(GovernanceEvent::EmergencyShutdown {
            reason: reason.to_string(),
            terminated,
            at: Utc::now(),
        });

        terminated
    }

    pub fn emergency_shutdown_count(&self) -> u64 {
        self.shutdown_count.load(Ordering::SeqCst)
    }

    /// Sweep expired reservations now. Returns how many were purged.
    pub fn purge_expired(&self) -> usize {
        let purged = self
            .state
            .lock()
            .purge(Instant::now(), self.config.tombstone_retention());
        if purged > 0 {
            debug!("Purged {} expired reservation(s)", purged);
        }
        purged
    }

    /// Start the periodic reservation sweep
    pub fn start_cleanup(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let token = self.background.clone();
        let interval = self.config.cleanup_interval();
        let retention = self.config.tombstone_retention();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = state.lock().purge(Instant::now(), retention);
                        if purged > 0 {
                            debug!("Cleanup purged {} expired reservation(s)", purged);
                        }
                    }
                }
            }
        })
    }

    /// Shut everything down on SIGINT/SIGTERM or on panic
    pub fn install_shutdown_hooks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            if let Some(controller) = weak.upgrade() {
                controller.emergency_shutdown(&format!("Uncaught panic: {}", panic_info));
            }
            previous(panic_info);
        }));

        let weak = Arc::downgrade(self);
        let token = self.background.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                signal = wait_for_termination_signal() => {
                    if let Some(controller) = weak.upgrade() {
                        controller.emergency_shutdown(&format!("Received {}", signal));
                    }
                }
            }
        });
    }

    pub fn get_process(&self, id: &str) -> Option<ManagedProcess> {
        self.state.lock().active.get(id).cloned()
    }

    pub fn active_processes(&self) -> Vec<ProcessSnapshot> {
        let now = Instant::now();
        self.state
            .lock()
            .active
            .values()
            .map(|p| p.snapshot(now))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Outstanding reservations, expired ones excluded
    pub fn reservation_count(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .reservations
            .values()
            .filter(|r| !r.is_expired(now))
            .count()
    }

    /// Whether the current load is at or past the warning threshold
    pub fn is_approaching_limit(&self) -> bool {
        self.active_count() + self.reservation_count() >= self.config.limits.warning_threshold
    }

    pub fn stats(&self) -> AdmissionStats {
        let now = Instant::now();
        let state = self.state.lock();

        let mut active: BTreeMap<ProcessKind, usize> =
            ProcessKind::ALL.iter().map(|k| (*k, 0)).collect();
        let mut reserved = active.clone();

        for process in state.active.values() {
            *active.entry(process.kind).or_default() += 1;
        }
        for reservation in state.reservations.values().filter(|r| !r.is_expired(now)) {
            *reserved.entry(reservation.kind).or_default() += 1;
        }

        AdmissionStats {
            active_total: state.active.len(),
            reserved_total: reserved.values().sum(),
            active,
            reserved,
            limits: self.config.limits.clone(),
            emergency_shutdowns: self.emergency_shutdown_count(),
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

async fn wait_for_termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn limits(ai: usize, total: usize) -> AdmissionConfig {
        AdmissionConfig {
            limits: ProcessLimits {
                max_ai_assistant: ai,
                max_test_runner_a: 3,
                max_test_runner_b: 3,
                max_total: total,
                warning_threshold: total,
            },
            ..Default::default()
        }
    }

    fn sleeper(secs: u32) -> ProcessHandle {
        ProcessManager::new()
            .spawn(&SpawnConfig::new(ProcessKind::Other, "sleep").arg(secs.to_string()))
            .unwrap()
    }

    /// Race `threads` callers through `reserve_slot`, returning how many got a slot
    fn race_reservations(
        controller: &AdmissionController,
        threads: usize,
        kind_of: fn(usize) -> ProcessKind,
    ) -> usize {
        let barrier = Barrier::new(threads);
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for i in 0..threads {
                let (barrier, admitted) = (&barrier, &admitted);
                scope.spawn(move || {
                    barrier.wait();
                    let component = format!("racer-{}", i);
                    if controller.reserve_slot(kind_of(i), &component, None).is_ok() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        admitted.into_inner()
    }

    #[test]
    fn test_concurrent_reservations_respect_kind_cap() {
        let controller = AdmissionController::new(limits(5, 12));

        let admitted = race_reservations(&controller, 32, |_| ProcessKind::AiAssistant);

        assert_eq!(admitted, 5);
        let stats = controller.stats();
        assert_eq!(stats.reserved_total, 5);
        assert_eq!(stats.reserved[&ProcessKind::AiAssistant], 5);
    }

    #[test]
    fn test_concurrent_reservations_respect_total_cap() {
        let controller = AdmissionController::new(limits(5, 6));

        let admitted = race_reservations(&controller, 32, |i| ProcessKind::ALL[i % ProcessKind::ALL.len()]);

        assert_eq!(admitted, 6);
        let stats = controller.stats();
        assert_eq!(stats.reserved_total, 6);
        assert!(stats.reserved[&ProcessKind::TestRunnerA] <= 3);
        assert!(stats.reserved[&ProcessKind::TestRunnerB] <= 3);
    }

    #[test]
    fn test_sixth_ai_assistant_is_denied() {
        let controller = AdmissionController::new(limits(5, 12));

        for _ in 0..5 {
            controller
                .reserve_slot(ProcessKind::AiAssistant, "generator", None)
                .unwrap();
        }

        let err = controller
            .reserve_slot(ProcessKind::AiAssistant, "generator", None)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("process limit exceeded"), "{}", message);
        assert!(message.contains("5/5"), "{}", message);
    }

    #[test]
    fn test_total_limit_and_no_mutation_on_denial() {
        let controller = AdmissionController::new(limits(5, 3));
        controller.reserve_slot(ProcessKind::AiAssistant, "a", None).unwrap();
        controller.reserve_slot(ProcessKind::TestRunnerA, "b", None).unwrap();
        controller.reserve_slot(ProcessKind::Other, "c", None).unwrap();

        let before = controller.stats();
        let err = controller
            .reserve_slot(ProcessKind::TestRunnerB, "d", None)
            .unwrap_err();
        assert!(err.to_string().contains("Total process limit exceeded: 3/3"));
        assert_eq!(controller.stats(), before);
    }

    #[test]
    fn test_other_kind_bounded_by_total_only() {
        let controller = AdmissionController::new(limits(1, 6));
        for _ in 0..6 {
            controller.reserve_slot(ProcessKind::Other, "misc", None).unwrap();
        }
        assert!(controller.reserve_slot(ProcessKind::Other, "misc", None).is_err());
    }

    #[test]
    fn test_limits_validation() {
        assert!(ProcessLimits::default().validate().is_ok());
        let bad = ProcessLimits {
            warning_threshold: 20,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let zero = ProcessLimits {
            max_test_runner_a: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn test_register_consumes_reservation_once() {
        let controller = AdmissionController::new(limits(5, 12));
        let rsv = controller
            .reserve_slot(ProcessKind::TestRunnerB, "pytest", None)
            .unwrap();
        let handle = sleeper(5);

        let process = controller
            .register_process(&rsv, handle.clone(), Some("run-1".into()))
            .unwrap();
        assert_eq!(process.id, "run-1");
        assert_eq!(controller.active_count(), 1);
        assert_eq!(controller.reservation_count(), 0);

        let again = controller.register_process(&rsv, handle.clone(), None);
        assert!(matches!(again, Err(GovernorError::ReservationAlreadyUsed(_))));
        assert_eq!(controller.active_count(), 1);

        handle.force_kill();
    }

    #[tokio::test]
    async fn test_unknown_reservation() {
        let controller = AdmissionController::default();
        let handle = sleeper(5);
        let result = controller.register_process("rsv_missing", handle.clone(), None);
        assert!(matches!(result, Err(GovernorError::ReservationNotFound(_))));
        handle.force_kill();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_reservation_rejected_before_cleanup() {
        let controller = AdmissionController::default();
        let rsv = controller
            .reserve_slot(ProcessKind::AiAssistant, "gen", Some(Duration::from_millis(100)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(controller.reservation_count(), 0);

        let handle = sleeper(5);
        let result = controller.register_process(&rsv, handle.clone(), None);
        assert!(matches!(result, Err(GovernorError::ReservationExpired(_))));

        // Still expired, not "not found", after the sweep
        controller.purge_expired();
        let result = controller.register_process(&rsv, handle.clone(), None);
        assert!(matches!(result, Err(GovernorError::ReservationExpired(_))));
        handle.force_kill();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_purges_expired() {
        let controller = AdmissionController::new(AdmissionConfig {
            cleanup_interval_ms: 1_000,
            ..Default::default()
        });
        let _cleanup = controller.start_cleanup();
        let rsv = controller
            .reserve_slot(ProcessKind::Other, "x", Some(Duration::from_millis(500)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(controller.state.lock().reservations.get(&rsv).is_none());
    }

    #[tokio::test]
    async fn test_approaching_limit_event() {
        let mut config = limits(5, 4);
        config.limits.warning_threshold = 2;
        let controller = AdmissionController::new(config);
        let mut events = controller.subscribe();

        controller.reserve_slot(ProcessKind::Other, "a", None).unwrap();
        assert!(events.try_recv().is_err());

        controller.reserve_slot(ProcessKind::Other, "b", None).unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.name(), "approaching-limit");
        assert!(controller.is_approaching_limit());
    }

    #[tokio::test]
    async fn test_exit_unregisters_automatically() {
        let controller = AdmissionController::default();
        let mut events = controller.subscribe();
        let rsv = controller.reserve_slot(ProcessKind::Other, "sh", None).unwrap();
        let handle = ProcessManager::new()
            .spawn(&SpawnConfig::new(ProcessKind::Other, "sh").args(["-c", "echo done"]))
            .unwrap();
        controller.register_process(&rsv, handle, Some("short".into())).unwrap();

        loop {
            match events.recv().await.unwrap() {
                GovernanceEvent::ProcessUnregistered { id, reason, exit_code, .. } => {
                    assert_eq!(id, "short");
                    assert_eq!(reason, UnregisterReason::Exited);
                    assert_eq!(exit_code, Some(0));
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(controller.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let controller = AdmissionController::default();
        let rsv = controller.reserve_slot(ProcessKind::Other, "x", None).unwrap();
        let handle = sleeper(5);
        controller.register_process(&rsv, handle.clone(), Some("p".into())).unwrap();

        controller.unregister_process("p");
        controller.unregister_process("p");
        controller.unregister_process("never-existed");
        assert_eq!(controller.active_count(), 0);
        handle.force_kill();
    }

    #[tokio::test]
    async fn test_emergency_shutdown_kills_everything() {
        let controller = AdmissionController::new(limits(2, 3));
        let mut events = controller.subscribe();
        let mut handles = Vec::new();

        for i in 0..2 {
            let rsv = controller
                .reserve_slot(ProcessKind::AiAssistant, "gen", None)
                .unwrap();
            let handle = sleeper(30);
            controller
                .register_process(&rsv, handle.clone(), Some(format!("p{}", i)))
                .unwrap();
            handles.push(handle);
        }
        let pending = controller.reserve_slot(ProcessKind::Other, "x", None).unwrap();

        let terminated = controller.emergency_shutdown("operator request");
        assert_eq!(terminated, 2);
        assert_eq!(controller.active_count(), 0);
        assert_eq!(controller.reservation_count(), 0);
        assert_eq!(controller.emergency_shutdown_count(), 1);

        for handle in &handles {
            let outcome = handle.wait().await;
            assert!(!outcome.success());
        }

        let shutdown = loop {
            let event = events.recv().await.unwrap();
            if let GovernanceEvent::EmergencyShutdown { reason, terminated, .. } = event {
                break (reason, terminated);
            }
        };
        assert_eq!(shutdown, ("operator request".to_string(), 2));

        let handle = sleeper(5);
        assert!(controller.register_process(&pending, handle.clone(), None).is_err());
        handle.force_kill();

        // Back to zero load
        controller.reserve_slot(ProcessKind::AiAssistant, "gen", None).unwrap();
        controller.reserve_slot(ProcessKind::AiAssistant, "gen", None).unwrap();
        controller.reserve_slot(ProcessKind::Other, "gen", None).unwrap();
    }

    fn kind_strategy() -> impl Strategy<Value = ProcessKind> {
        prop_oneof![
            Just(ProcessKind::AiAssistant),
            Just(ProcessKind::TestRunnerA),
            Just(ProcessKind::TestRunnerB),
            Just(ProcessKind::Other),
        ]
    }

    proptest! {
        #[test]
        fn prop_reservations_never_exceed_limits(kinds in proptest::collection::vec(kind_strategy(), 0..40)) {
            let limits = ProcessLimits {
                max_ai_assistant: 4,
                max_test_runner_a: 2,
                max_test_runner_b: 3,
                max_total: 8,
                warning_threshold: 6,
            };
            let controller = AdmissionController::new(AdmissionConfig {
                limits: limits.clone(),
                ..Default::default()
            });
            let mut expected: HashMap<ProcessKind, usize> = HashMap::new();

            for kind in kinds {
                let kind_count = expected.get(&kind).copied().unwrap_or(0);
                let total: usize = expected.values().sum();
                let fits = limits.cap_for(kind).map_or(true, |cap| kind_count < cap)
                    && total < limits.max_total;

                let result = controller.reserve_slot(kind, "prop", None);
                prop_assert_eq!(result.is_ok(), fits);
                if fits {
                    *expected.entry(kind).or_default() += 1;
                }
            }

            let stats = controller.stats();
            prop_assert!(stats.reserved_total <= limits.max_total);
            prop_assert_eq!(stats.reserved_total, expected.values().sum::<usize>());
        }
    }
}
