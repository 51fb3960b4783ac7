//! Domain model for cluster operations.
//!
//! A [`Plan`] is the persisted, resumable description of an install or
//! upgrade: the ordered set of [`Phase`]s, the [`Server`]s they target and
//! the state of every phase.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
