//! Natter - an IMS/RCS messaging session engine
//!
//! SIP-signalled session lifecycle (chat, group chat, file transfer,
//! store-and-forward retrieval, pager-mode messages), AKA-digest
//! authentication and the MSRP media sub-protocol.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::EngineError;
pub use domain::shared::Result;
