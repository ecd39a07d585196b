//! Application layer - session orchestration
//!
//! This layer drives domain objects through their use cases:
//! - Session workers (originating and terminating flows, media bring-up)
//! - Pager-mode dispatch with its single background worker

pub mod dispatch;
pub mod engine;

pub use dispatch::{route_for, DeliveryRoute, PagerDispatcher, PagerMessage};
pub use engine::SessionEngine;
