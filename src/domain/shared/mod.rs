//! Shared domain types

pub mod error;
pub mod events;

pub use error::{EngineError, Result};
pub use events::{
    AbortOrigin, ListenerSet, SessionEvent, SessionListener, SessionOutcome, TerminationReason,
};
