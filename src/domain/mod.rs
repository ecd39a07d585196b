//! Domain layer - session lifecycle and content rules
//!
//! This layer contains:
//! - Entities: sessions with identity and a state machine
//! - Shared kernel: error taxonomy, events, listener broadcast
//! - Content descriptors and the transfer attribute views

pub mod content;
pub mod registry;
pub mod session;
pub mod shared;
