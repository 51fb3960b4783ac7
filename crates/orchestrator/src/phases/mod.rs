//! Built-in phase executors.
//!
//! - [`ChecksExecutor`] - storage requirements of the installer node
//! - [`DnsExecutor`] - DNS overrides for the cluster resolver
//! - [`WaitExecutor`] - control plane convergence
//! - [`NodesExecutor`] - node labels and taints, one phase per server
//! - [`RbacExecutor`] - bootstrap resources from the package
//! - [`ResourcesExecutor`] - user supplied resources
//! - [`AppExecutor`] - application lifecycle hooks

mod app;
mod checks;
mod dns;
mod nodes;
mod rbac;
mod resources;
mod wait;

pub use app::{hooks_for, AppExecutor};
pub use checks::ChecksExecutor;
pub use dns::{overrides_manifest, DnsExecutor, OVERRIDES_CONFIG_MAP, OVERRIDES_NAMESPACE};
pub use nodes::NodesExecutor;
pub use rbac::RbacExecutor;
pub use resources::ResourcesExecutor;
pub use wait::WaitExecutor;
