//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow protocol progress without tight coupling to the
//! engine. Observers are invoked synchronously from the thread driving the
//! device.

use std::fmt;

use crate::protocol::{DfuState, DfuStatus};

/// What the engine is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Idle,
    Detach,
    Erase,
    Write,
    Read,
    Verify,
    Manifest,
    Attach,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Idle => write!(f, "Idle"),
            Action::Detach => write!(f, "Detaching"),
            Action::Erase => write!(f, "Erasing"),
            Action::Write => write!(f, "Writing"),
            Action::Read => write!(f, "Reading"),
            Action::Verify => write!(f, "Verifying"),
            Action::Manifest => write!(f, "Manifesting"),
            Action::Attach => write!(f, "Attaching"),
        }
    }
}

/// Events emitted by a DFU device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    /// Device connected (after open or re-enumeration).
    DeviceConnected { vid: u16, pid: u16 },
    /// Device disconnected (might re-enumerate with different PID).
    DeviceDisconnected,
    /// GETSTATUS reported a different state or status.
    StateChanged { state: DfuState, status: DfuStatus },
    ActionChanged { action: Action },
    /// Percentage of the current action, 0..=100.
    Progress { action: Action, percentage: u8 },
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            DfuEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            DfuEvent::StateChanged { state, status } => {
                tracing::debug!(state = %state, status = %status, "State changed");
            }
            DfuEvent::ActionChanged { action } => {
                tracing::info!(action = %action, "Action changed");
            }
            DfuEvent::Progress { action, percentage } => {
                tracing::debug!(action = %action, progress = %format!("{}%", percentage), "Progress");
            }
        }
    }
}

/// Turns byte counts into `Progress` events, emitting only when the
/// percentage increases.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    action: Action,
    total: u64,
    done: u64,
    last: Option<u8>,
}

impl ProgressTracker {
    pub(crate) fn new(action: Action, total: u64) -> Self {
        Self {
            action,
            total,
            done: 0,
            last: None,
        }
    }

    pub(crate) fn advance(&mut self, bytes: u64, observer: &dyn DfuObserver) {
        self.done = (self.done + bytes).min(self.total);
        let percentage = if self.total == 0 {
            100
        } else {
            ((self.done * 100) / self.total) as u8
        };
        if self.last.is_none_or(|last| percentage > last) {
            self.last = Some(percentage);
            observer.on_event(&DfuEvent::Progress {
                action: self.action,
                percentage,
            });
        }
    }
}

/// Observer that keeps every event, for tests and scripting.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Percentages reported for `action`, in order.
    pub fn progress(&self, action: Action) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::Progress {
                    action: a,
                    percentage,
                } if a == action => Some(percentage),
                _ => None,
            })
            .collect()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
