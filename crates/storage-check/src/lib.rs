//! Storage health checks for a node volume.
//!
//! A [`StorageChecker`] validates a path against a filesystem allow-list, a
//! free capacity floor and a minimum sequential write throughput. Each enabled
//! check dimension reports one [`Probe`].

mod checker;
mod error;
mod os;
mod probe;

pub use checker::{StorageChecker, StorageConfig, BLOCK_SIZE, CYCLES};
pub use error::{Result, StorageError};
pub use os::{Mount, OsInterface, RealOs};
pub use probe::{human_bytes, Probe, ProbeStatus, Reporter};
