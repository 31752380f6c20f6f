//! Governance events
//!
//! A closed set of notifications published by the admission controller.
//! Consumers subscribe through a broadcast channel; slow consumers miss
//! events (`RecvError::Lagged`) rather than blocking admission.

use crate::runtime::process_manager::ProcessKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default subscriber buffer
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a process left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisterReason {
    Exited,
    Errored,
    Explicit,
}

/// Events emitted by the admission controller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GovernanceEvent {
    /// Projected total reached the warning threshold. Advisory only.
    ApproachingLimit {
        kind: ProcessKind,
        projected_total: usize,
        warning_threshold: usize,
        max_total: usize,
        at: DateTime<Utc>,
    },

    ProcessRegistered {
        id: String,
        kind: ProcessKind,
        component: String,
        pid: u32,
        at: DateTime<Utc>,
    },

    ProcessUnregistered {
        id: String,
        kind: ProcessKind,
        reason: UnregisterReason,
        exit_code: Option<i32>,
        at: DateTime<Utc>,
    },

    EmergencyShutdown {
        reason: String,
        terminated: usize,
        at: DateTime<Utc>,
    },
}

impl GovernanceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GovernanceEvent::ApproachingLimit { .. } => "approaching-limit",
            GovernanceEvent::ProcessRegistered { .. } => "process-registered",
            GovernanceEvent::ProcessUnregistered { .. } => "process-unregistered",
            GovernanceEvent::EmergencyShutdown { .. } => "emergency-shutdown",
        }
    }
}

/// Publisher side of the event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GovernanceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernanceEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. No subscribers is not an error.
    pub fn publish(&self, event: GovernanceEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
