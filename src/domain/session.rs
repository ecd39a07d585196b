//! Session entity and state machine
//!
//! A session covers one SIP dialog plus its media leg, from the first INVITE
//! to a terminal state. Terminal states are absorbing: once terminated, every
//! further transition request is a no-op, which makes `close()` idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::content::FileDescriptor;
use crate::domain::shared::{
    AbortOrigin, EngineError, ListenerSet, Result, SessionEvent, SessionListener, SessionOutcome,
    TerminationReason,
};
use crate::infrastructure::protocols::sip::DialogPath;

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Originating,
    Terminating,
}

/// What the session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Chat,
    GroupChat,
    FileTransfer,
    /// Terminating retrieval of messages held by the store-and-forward server
    DeferredRetrieval,
}

/// Lifecycle states. `Terminated` absorbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    AuthChallenged,
    SignalingEstablished,
    MediaEstablished,
    Terminating,
    Terminated(TerminationReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated(_))
    }

    fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Terminated(_), _) => false,
            (_, Terminated(_)) | (_, Terminating) => true,
            (Idle, Negotiating) => true,
            (Negotiating, AuthChallenged) => true,
            (AuthChallenged, Negotiating) => true,
            (Negotiating, SignalingEstablished) => true,
            (SignalingEstablished, MediaEstablished) => true,
            (Terminating, _) => false,
            _ => false,
        }
    }
}

struct SessionInner {
    state: SessionState,
    abort_origin: AbortOrigin,
}

/// One messaging session: identity, dialog, state and listeners.
pub struct Session {
    session_id: Uuid,
    contribution_id: String,
    conversation_id: String,
    remote_party: String,
    role: SessionRole,
    kind: SessionKind,
    dialog: Mutex<DialogPath>,
    content: Option<FileDescriptor>,
    inner: Mutex<SessionInner>,
    listeners: ListenerSet,
    interrupted: AtomicBool,
    interrupt_notify: Notify,
}

impl Session {
    /// New originating session with fresh contribution/conversation ids.
    pub fn originating(kind: SessionKind, remote_party: &str, local_domain: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            contribution_id: Uuid::new_v4().to_string(),
            conversation_id: Uuid::new_v4().to_string(),
            remote_party: remote_party.to_string(),
            role: SessionRole::Originating,
            kind,
            dialog: Mutex::new(DialogPath::originating(local_domain)),
            content: None,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                abort_origin: AbortOrigin::Local,
            }),
            listeners: ListenerSet::new(),
            interrupted: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
        }
    }

    /// New originating file-transfer session. The descriptor's transferred
    /// offset drives the `file-range` resume attribute in the SDP offer.
    pub fn originating_transfer(
        remote_party: &str,
        local_domain: &str,
        file: FileDescriptor,
    ) -> Self {
        let mut session = Self::originating(SessionKind::FileTransfer, remote_party, local_domain);
        session.content = Some(file);
        session
    }

    /// New terminating session adopting the inviter's dialog identity and
    /// echoing its contribution/conversation ids when present.
    pub fn terminating(
        kind: SessionKind,
        remote_party: &str,
        dialog: DialogPath,
        contribution_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            contribution_id: contribution_id
                .map(|s| s.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: conversation_id
                .map(|s| s.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            remote_party: remote_party.to_string(),
            role: SessionRole::Terminating,
            kind,
            dialog: Mutex::new(dialog),
            content: None,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                abort_origin: AbortOrigin::Local,
            }),
            listeners: ListenerSet::new(),
            interrupted: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn contribution_id(&self) -> &str {
        &self.contribution_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn remote_party(&self) -> &str {
        &self.remote_party
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// File being transferred, for file-transfer sessions.
    pub fn content(&self) -> Option<&FileDescriptor> {
        self.content.as_ref()
    }

    pub fn call_id(&self) -> String {
        self.dialog.lock().unwrap().call_id().to_string()
    }

    /// Run a closure against the dialog under its lock.
    pub fn with_dialog<R>(&self, f: impl FnOnce(&mut DialogPath) -> R) -> R {
        let mut dialog = self.dialog.lock().unwrap();
        f(&mut dialog)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn register_listener(&self, listener: std::sync::Arc<dyn SessionListener>) {
        self.listeners.register(listener);
    }

    /// Mark the session interrupted. Workers check this after every await;
    /// workers parked on a channel are woken through `wait_interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Resolve once the session is interrupted. Completes immediately when
    /// the flag is already set.
    pub async fn wait_interrupted(&self) {
        let notified = self.interrupt_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_interrupted() {
            return;
        }
        notified.await;
    }

    /// Fail fast if the session was interrupted.
    pub fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Attempt a state transition, rejecting illegal moves. Transitions out
    /// of a terminal state fail with `InvalidStateTransition` unless the
    /// target is also terminal, in which case they are silently absorbed.
    pub fn transition(&self, next: SessionState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            if next.is_terminal() {
                // close() after termination is a no-op
                return Ok(());
            }
            return Err(EngineError::InvalidStateTransition(format!(
                "{:?} -> {:?}",
                inner.state, next
            )));
        }
        if !inner.state.can_transition_to(&next) {
            return Err(EngineError::InvalidStateTransition(format!(
                "{:?} -> {:?}",
                inner.state, next
            )));
        }
        inner.state = next;
        Ok(())
    }

    pub fn notify(&self, event: SessionEvent) {
        self.listeners.broadcast(&event);
    }

    /// Drive the session to a terminal state and notify listeners exactly
    /// once. Safe to call repeatedly.
    pub fn terminate(&self, reason: TerminationReason, origin: AbortOrigin) {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = SessionState::Terminated(reason);
            inner.abort_origin = origin;
            SessionOutcome::from_termination(reason, origin)
        };
        self.listeners.broadcast(&SessionEvent::Terminated(outcome));
    }

    /// Local close: interrupt the worker and terminate as a local abort if
    /// nothing has terminated the session yet.
    pub fn close(&self) {
        self.interrupt();
        self.terminate(TerminationReason::Aborted, AbortOrigin::Local);
    }

    /// Remote BYE.
    pub fn receive_bye(&self) {
        self.terminate(TerminationReason::Aborted, AbortOrigin::Remote);
    }

    /// Translate a worker error into termination.
    pub fn handle_error(&self, error: &EngineError) {
        let reason = match error {
            EngineError::Interrupted => TerminationReason::Aborted,
            _ => TerminationReason::Error,
        };
        self.terminate(reason, AbortOrigin::System);
    }
}
