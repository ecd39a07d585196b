//! Engine error taxonomy

use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the session engine.
///
/// Payload errors are always fatal to the current operation and never retried
/// blindly. Network errors are retried only where the protocol allows it (the
/// 407 challenge loop). Auth errors are fatal beyond the single AUTS
/// resynchronization attempt.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Session interrupted")]
    Interrupted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a failed send may be retried under protocol rules.
    ///
    /// Only network-level failures qualify; payload and auth failures must
    /// surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Network(_))
    }
}
