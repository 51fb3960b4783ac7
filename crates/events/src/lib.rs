//! Event system for cluster operations
//!
//! This crate provides the event bus and event types used to report
//! operation progress to logs, terminals and any attached UI.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
