use uuid::Uuid;

/// A node of the cluster, as listed in `system.local` and `system.peers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    /// Address of the node, without a port unless it was given with one.
    pub peer: String,
    /// Data center of the node.
    pub data_center: String,
    /// Rack of the node.
    pub rack: String,
    /// Id the node identifies itself with.
    pub host_id: Uuid,
    /// Tokens owned by the node.
    pub tokens: Vec<String>,
}

impl HostInfo {
    /// A node known only by its address.
    pub fn new(peer: impl Into<String>) -> Self {
        HostInfo {
            peer: peer.into(),
            ..Default::default()
        }
    }
}
