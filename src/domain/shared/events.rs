//! Session events and listener broadcast
//!
//! Listener registration/removal is safe to call while a broadcast is in
//! flight: delivery iterates over a snapshot taken under the lock, never the
//! live set.

use std::sync::{Arc, Mutex};

use crate::domain::shared::error::EngineError;

/// Reason a session reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Transfer/exchange ran to completion
    Completed,
    /// Explicit BYE before completion
    Aborted,
    /// Remote rejected the invitation
    Rejected,
    /// Transport, payload or protocol failure
    Error,
    /// The transaction layer gave up waiting
    TimedOut,
}

/// Who initiated an abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    Local,
    Remote,
    System,
}

/// Listener-visible session outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    AbortedByRemote,
    AbortedBySystem,
    Rejected,
    Error(String),
}

impl SessionOutcome {
    /// Collapse a terminal reason and origin into the listener-visible set.
    pub fn from_termination(reason: TerminationReason, origin: AbortOrigin) -> Self {
        match reason {
            TerminationReason::Completed => SessionOutcome::Completed,
            TerminationReason::Rejected => SessionOutcome::Rejected,
            TerminationReason::Aborted => match origin {
                AbortOrigin::Remote => SessionOutcome::AbortedByRemote,
                _ => SessionOutcome::AbortedBySystem,
            },
            TerminationReason::Error => SessionOutcome::Error("session error".to_string()),
            TerminationReason::TimedOut => SessionOutcome::Error("transaction timeout".to_string()),
        }
    }
}

/// Events emitted over a session's lifetime
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Signaling negotiation finished (2xx + ACK exchanged)
    SignalingEstablished,
    /// Media transport is open and usable
    MediaEstablished,
    /// A message arrived on the session
    MessageReceived {
        message_id: String,
        content_type: String,
        content: Vec<u8>,
        delivery_report_wanted: bool,
        display_report_wanted: bool,
    },
    /// Transfer progress in bytes
    TransferProgress { transferred: u64, total: u64 },
    /// Session reached a terminal state
    Terminated(SessionOutcome),
    /// A non-terminal error worth reporting
    Error(EngineError),
}

/// Session event listener
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Copy-on-read listener set.
///
/// Broadcasting snapshots the registered listeners before invoking any of
/// them, so a listener may add or remove listeners from inside its callback.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<Mutex<Vec<Arc<dyn SessionListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn register(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Remove all listeners sharing the given pointer identity.
    pub fn remove(&self, listener: &Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast(&self, event: &SessionEvent) {
        let snapshot: Vec<Arc<dyn SessionListener>> =
            self.listeners.lock().unwrap().iter().cloned().collect();
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}
