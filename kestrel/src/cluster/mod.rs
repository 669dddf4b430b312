//! Cluster topology: the nodes a session knows about and their discovery.

mod discovery;
mod host;

pub use discovery::{DiscoveryConfig, RingDescriber};
pub use host::HostInfo;
